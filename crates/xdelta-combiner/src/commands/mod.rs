mod cache;
mod combine;
mod dump;
mod hash;
mod run;

pub use cache::*;
pub use combine::*;
pub use dump::*;
pub use hash::*;
pub use run::*;
