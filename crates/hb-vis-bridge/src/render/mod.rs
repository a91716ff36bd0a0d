//! Rendering pipeline: per-view capture loops, the frame store, the
//! subscription registry, and the pool that ties them together with
//! admission control and browser lifecycle.

pub mod frame;
pub mod pool;
mod reload;
pub mod scripts;
pub mod session;
pub mod subscribe;

pub use frame::{Frame, FrameStore};
pub use pool::RendererPool;
pub use session::ViewSession;
pub use subscribe::{SharedRegistry, Subscriber, SubscriptionRegistry};
