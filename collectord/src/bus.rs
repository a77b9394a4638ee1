use std::sync::Arc;
use parking_lot::Mutex;

/// The store and the display share one physical bus; whoever talks on it
/// holds this lock for the whole open/query/close or paint sequence.
pub type Bus = Arc<Mutex<()>>;

pub fn new_bus() -> Bus {
    Arc::new(Mutex::new(()))
}
