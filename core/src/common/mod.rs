pub mod bounded;
pub mod prque;
pub mod spawn;
pub mod ticker;

pub use bounded::{BoundedMap, EvictionOrder};
pub use prque::Prque;
pub use spawn::{Job, Spawner, TokioSpawner};
pub use ticker::Ticker;
