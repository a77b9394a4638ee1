use shared::types::{FieldValue, Record};

/// Decide whether a record is too anonymous to be worth a store row.
///
/// Rule order matters: a record still waiting on an organization or vendor
/// lookup is kept until both are resolved.
pub fn is_anonymous(record: &Record) -> bool {
    if record.name.is_text() {
        return false;
    }
    if record.appearance != 0 {
        return false;
    }
    if record.organization == FieldValue::Unpopulated || record.vendor == FieldValue::Unpopulated {
        return false;
    }
    if matches!(
        record.organization,
        FieldValue::Private | FieldValue::Random | FieldValue::Empty
    ) {
        return true;
    }
    if matches!(record.vendor, FieldValue::Unknown | FieldValue::Empty) {
        return true;
    }
    !(record.organization.is_text() && record.vendor.is_text())
}
