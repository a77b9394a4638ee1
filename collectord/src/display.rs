use shared::types::Record;
use crate::bus::Bus;

/// Presentation surface for merged records and status lines.
pub trait Display: Send {
    fn print_card(&mut self, record: &Record);
    fn status(&mut self, line: &str);
}

/// Paints cards as structured log events, holding the bus while doing so.
pub struct TracingDisplay {
    bus: Bus,
    cards: u64,
}

impl TracingDisplay {
    pub fn new(bus: Bus) -> Self {
        Self { bus, cards: 0 }
    }
}

impl Display for TracingDisplay {
    fn print_card(&mut self, record: &Record) {
        let _bus = self.bus.lock();
        self.cards += 1;
        tracing::info!(
            target: "collectord::card",
            address = %record.address,
            rssi = record.rssi,
            name = %record.name,
            organization = %record.organization,
            vendor = %record.vendor,
            appearance = record.appearance,
            hits = record.hits,
            known = record.in_store,
            anonymous = record.is_anonymous,
            "card #{}",
            self.cards
        );
    }

    fn status(&mut self, line: &str) {
        let _bus = self.bus.lock();
        tracing::info!(target: "collectord::status", "{}", line);
    }
}
