pub mod hash;
pub mod lookup;
pub mod pool;

use shared::types::Record;

/// Long-lived device cache and scan staging storage share this shape.
pub type DevicePool = pool::SlotPool<Record>;
