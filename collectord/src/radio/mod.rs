pub mod replay;

use std::time::Duration;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use shared::types::{AddressKind, MacAddress};

/// One raw advertisement as delivered by the radio during a scan window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Advertisement {
    pub address: MacAddress,
    #[serde(default)]
    pub kind: AddressKind,
    pub rssi: i16,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub appearance: Option<u16>,
    /// Hex encoded; the first two bytes are the little-endian company id
    #[serde(default)]
    pub manufacturer_data: Option<String>,
    #[serde(default)]
    pub service_id: Option<String>,
}

impl Advertisement {
    pub fn manufacturer_id(&self) -> Option<u16> {
        let bytes = hex::decode(self.manufacturer_data.as_deref()?).ok()?;
        match bytes.as_slice() {
            [lo, hi, ..] => Some(u16::from_le_bytes([*lo, *hi])),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanEnd {
    /// The window closed normally
    Completed,
    /// The driver has nothing more to deliver
    Exhausted,
}

/// Radio scan driver: runs one scan window, handing each advertisement to
/// `sink`, and returns once the window is over.
pub trait ScanDriver: Send {
    fn scan(&mut self, window: Duration, sink: &mut dyn FnMut(Advertisement)) -> Result<ScanEnd>;
}

#[cfg(test)]
pub mod testing {
    use std::collections::VecDeque;
    use super::*;

    /// Driver replaying scan windows from memory.
    #[derive(Default)]
    pub struct ScriptedDriver {
        pub windows: VecDeque<Vec<Advertisement>>,
        pub requested: Vec<Duration>,
    }

    impl ScanDriver for ScriptedDriver {
        fn scan(&mut self, window: Duration, sink: &mut dyn FnMut(Advertisement)) -> Result<ScanEnd> {
            self.requested.push(window);
            match self.windows.pop_front() {
                Some(adverts) => {
                    adverts.into_iter().for_each(sink);
                    Ok(ScanEnd::Completed)
                }
                None => Ok(ScanEnd::Exhausted),
            }
        }
    }
}
