use serde::Serialize;
use sha2::{Sha256, Digest};
use shared::types::{FieldValue, MacAddress, Record};

/// Hash only identity and resolved metadata: rssi, hits and timestamps move
/// on every sighting without changing what an admin client would display.
#[derive(Serialize)]
struct HashView<'a> {
    address: MacAddress,
    name: &'a FieldValue,
    organization: &'a FieldValue,
    vendor: &'a FieldValue,
    service_id: &'a FieldValue,
    appearance: u16,
    in_store: bool,
}

/// Computes a SHA-256 hash of the pool's occupants.
/// Records are sorted by address for deterministic output.
pub fn pool_digest<'a>(records: impl IntoIterator<Item = &'a Record>) -> String {
    let mut views: Vec<HashView<'_>> = records
        .into_iter()
        .map(|r| HashView {
            address: r.address,
            name: &r.name,
            organization: &r.organization,
            vendor: &r.vendor,
            service_id: &r.service_id,
            appearance: r.appearance,
            in_store: r.in_store,
        })
        .collect();
    views.sort_by_key(|v| v.address);

    let mut hasher = Sha256::new();
    for view in &views {
        // Serializing plain strings/ints into a Vec cannot fail
        if let Ok(bytes) = serde_json::to_vec(view) {
            hasher.update(&bytes);
        }
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}
