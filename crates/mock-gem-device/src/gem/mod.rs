//! GEM buffer objects, contexts and the device-level bookkeeping that owns their release.

mod context;
mod mm;
mod object;

pub use context::{ContextRegistry, MockContext};
pub use mm::GemMm;
pub use object::GemObject;
