//! Clients for the two external platforms. Both are declared out of scope
//! by spec.md §1 ("the two third-party HTTP clients... with contracts
//! declared in §6") -- what's in scope is the trait boundary every other
//! component programs against, so tests substitute fakes.

pub mod platform_d;
pub mod platform_x;

pub use platform_d::{HttpPlatformD, PlatformD};
pub use platform_x::{HttpPlatformX, PlatformX};
