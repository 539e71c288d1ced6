//! Identity registry — which worker identities exist and which are busy.
//!
//! Core components:
//! - `identity` — validated identity token
//! - `source` — where eligible identities come from (descriptor files, static list)
//! - `checkout` — the registry itself, with race-free checkout/checkin

pub mod checkout;
pub mod identity;
pub mod source;

pub use checkout::{IdentityRegistry, SelectionPolicy};
pub use identity::Identity;
pub use source::{DescriptorDirSource, IdentitySource, StaticSource};
