//! Cross-source correlation.
//!
//! The PnP source is the anchor. Every anchor record claims at most one
//! record from each other source, chosen by [`MatchTier`]; the chosen record
//! is consumed so no other anchor can claim it. Sources with nothing for an
//! anchor contribute a placeholder. Whatever stays unconsumed is appended as
//! under-correlated groups so no record is lost.

use crate::record::{field, RawEnumerationRecord, SourceTag};
use std::cmp::Reverse;
use std::collections::BTreeSet;

/// A product family recognisable without a serial number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProductFamily {
    pub name: &'static str,
    /// Lowercase four-digit product ids.
    pub product_ids: &'static [&'static str],
    /// Uppercase markers that must all appear in a record's descriptive text.
    pub markers: &'static [&'static str],
}

/// Resolved first by product id, then by markers in table order, so more
/// specific entries come first.
pub const PRODUCT_FAMILIES: &[ProductFamily] = &[
    ProductFamily {
        name: "Padlock NVX",
        product_ids: &["1413"],
        markers: &["PADLOCK", "NVX"],
    },
    ProductFamily {
        name: "Aegis Portable",
        product_ids: &["0351"],
        markers: &["AEGIS", "PORTABLE"],
    },
    ProductFamily {
        name: "Secure Key 3Z",
        product_ids: &["1410"],
        markers: &["SECURE KEY 3Z"],
    },
    ProductFamily {
        name: "Secure Key 3.0",
        product_ids: &["1407", "1409"],
        markers: &["SECURE KEY"],
    },
    ProductFamily {
        name: "Padlock DT",
        product_ids: &["0315", "1406"],
        markers: &["PADLOCK DT"],
    },
    ProductFamily {
        name: "Padlock SSD",
        product_ids: &["1405"],
        markers: &["PADLOCK SSD"],
    },
    ProductFamily {
        name: "Padlock 3.0",
        product_ids: &["0310"],
        markers: &["PADLOCK 3"],
    },
    ProductFamily {
        name: "Fortress",
        product_ids: &["1400", "1408"],
        markers: &["FORTRESS"],
    },
];

pub fn family_of(record: &RawEnumerationRecord) -> Option<&'static ProductFamily> {
    if let Some(product_id) = record.text(field::PRODUCT_ID) {
        let product_id = product_id.trim().to_ascii_lowercase();
        if let Some(family) = PRODUCT_FAMILIES
            .iter()
            .find(|family| family.product_ids.contains(&product_id.as_str()))
        {
            return Some(family);
        }
    }
    let text = record.descriptive_text();
    PRODUCT_FAMILIES
        .iter()
        .find(|family| family.markers.iter().all(|marker| text.contains(marker)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchTier {
    None = 0,
    Family = 1,
    SerialFragment = 2,
    ExactSerial = 3,
}

/// Matching fields of one record, derived on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationKey {
    pub serial: Option<String>,
    pub vendor_product: Option<(String, String)>,
    pub family: Option<&'static ProductFamily>,
}

impl CorrelationKey {
    pub fn of(record: &RawEnumerationRecord) -> Self {
        let serial = record
            .text(field::SERIAL)
            .or_else(|| record.text(field::DEVICE_SERIAL))
            .map(|serial| serial.trim().to_string());
        let vendor_product = match (record.text(field::VENDOR_ID), record.text(field::PRODUCT_ID)) {
            (Some(vendor), Some(product)) => Some((
                vendor.trim().to_ascii_lowercase(),
                product.trim().to_ascii_lowercase(),
            )),
            _ => None,
        };
        Self {
            serial,
            vendor_product,
            family: family_of(record),
        }
    }

    pub fn tier_against(&self, candidate: &CorrelationKey) -> MatchTier {
        if let (Some(ours), Some(theirs)) = (&self.vendor_product, &candidate.vendor_product) {
            if ours != theirs {
                return MatchTier::None;
            }
        }
        match (&self.serial, &candidate.serial) {
            (Some(ours), Some(theirs)) if ours == theirs => MatchTier::ExactSerial,
            (Some(ours), Some(theirs)) if ours.contains(theirs.as_str()) || theirs.contains(ours.as_str()) => {
                MatchTier::SerialFragment
            }
            // Two serials that disagree are never joined on family alone.
            (Some(_), Some(_)) => MatchTier::None,
            // Equal pairs got past the check above.
            _ if self.vendor_product.is_some() && candidate.vendor_product.is_some() => MatchTier::Family,
            _ => match (self.family, candidate.family) {
                (Some(ours), Some(theirs)) if ours.name == theirs.name => MatchTier::Family,
                _ => MatchTier::None,
            },
        }
    }
}

/// Records from one source, in the order the source produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRecords {
    pub tag: SourceTag,
    pub records: Vec<RawEnumerationRecord>,
}

impl SourceRecords {
    pub fn new(tag: SourceTag, records: Vec<RawEnumerationRecord>) -> Self {
        Self { tag, records }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelatedGroup {
    /// Anchor first, then one record per other source in input order.
    /// Leftover groups hold a single record.
    pub records: Vec<RawEnumerationRecord>,
    /// Best tier achieved per non-anchor source. Empty for leftovers.
    pub tiers: Vec<MatchTier>,
    pub anchored: bool,
}

impl CorrelatedGroup {
    pub fn anchor(&self) -> Option<&RawEnumerationRecord> {
        if self.anchored {
            self.records.first()
        } else {
            None
        }
    }
}

/// Fuses per-source record lists into groups, one per anchor plus one per
/// leftover record.
///
/// The first `PnP` entry in `sources` is the anchor. Without one, every
/// record ends up as a leftover.
pub fn correlate(sources: &[SourceRecords]) -> Vec<CorrelatedGroup> {
    let anchor_index = sources.iter().position(|source| source.tag == SourceTag::PnP);
    let others: Vec<&SourceRecords> = sources
        .iter()
        .enumerate()
        .filter(|(index, _)| Some(*index) != anchor_index)
        .map(|(_, source)| source)
        .collect();

    let candidate_keys: Vec<Vec<CorrelationKey>> = others
        .iter()
        .map(|source| source.records.iter().map(CorrelationKey::of).collect())
        .collect();
    let mut consumed: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); others.len()];
    let mut groups = Vec::new();

    if let Some(anchor_index) = anchor_index {
        for anchor in &sources[anchor_index].records {
            let anchor_key = CorrelationKey::of(anchor);
            let mut records = vec![anchor.clone()];
            let mut tiers = Vec::with_capacity(others.len());

            for (slot, source) in others.iter().enumerate() {
                let best = source
                    .records
                    .iter()
                    .enumerate()
                    .filter(|(index, _)| !consumed[slot].contains(index))
                    .map(|(index, record)| {
                        let tier = anchor_key.tier_against(&candidate_keys[slot][index]);
                        (tier, Reverse(record.ordinal().unwrap_or(index)), index)
                    })
                    .filter(|(tier, _, _)| *tier > MatchTier::None)
                    .max();

                match best {
                    Some((tier, _, index)) => {
                        consumed[slot].insert(index);
                        records.push(source.records[index].clone());
                        tiers.push(tier);
                    }
                    None => {
                        records.push(RawEnumerationRecord::placeholder(source.tag));
                        tiers.push(MatchTier::None);
                    }
                }
            }

            tracing::debug!(
                serial = anchor_key.serial.as_deref().unwrap_or("-"),
                ?tiers,
                "correlated anchor"
            );
            groups.push(CorrelatedGroup {
                records,
                tiers,
                anchored: true,
            });
        }
    }

    for (slot, source) in others.iter().enumerate() {
        for (index, record) in source.records.iter().enumerate() {
            if consumed[slot].contains(&index) {
                continue;
            }
            tracing::debug!(source = %source.tag, index, "record left under-correlated");
            groups.push(CorrelatedGroup {
                records: vec![record.clone()],
                tiers: Vec::new(),
                anchored: false,
            });
        }
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pnp(ordinal: usize, serial: &str) -> RawEnumerationRecord {
        RawEnumerationRecord::new(SourceTag::PnP, ordinal)
            .with(field::VENDOR_ID, "0984")
            .with(field::PRODUCT_ID, "1407")
            .with(field::SERIAL, serial)
    }

    fn disk(ordinal: usize, serial: &str) -> RawEnumerationRecord {
        RawEnumerationRecord::new(SourceTag::DiskDrive, ordinal).with(field::SERIAL, serial)
    }

    #[test]
    fn exact_serial_beats_fragment() {
        let groups = correlate(&[
            SourceRecords::new(SourceTag::PnP, vec![pnp(0, "ABC123")]),
            SourceRecords::new(SourceTag::DiskDrive, vec![disk(0, "ABC123&0"), disk(1, "ABC123")]),
        ]);
        assert_eq!(groups[0].tiers, vec![MatchTier::ExactSerial]);
        assert_eq!(groups[0].records[1].ordinal(), Some(1));
        // The fragment match is left over.
        assert_eq!(groups.len(), 2);
        assert!(!groups[1].anchored);
    }

    #[test]
    fn ties_resolve_to_lowest_ordinal() {
        let groups = correlate(&[
            SourceRecords::new(SourceTag::PnP, vec![pnp(0, "SER")]),
            SourceRecords::new(SourceTag::DiskDrive, vec![disk(0, "SER&0"), disk(1, "SER&1")]),
        ]);
        assert_eq!(groups[0].tiers, vec![MatchTier::SerialFragment]);
        assert_eq!(groups[0].records[1].ordinal(), Some(0));
    }

    #[test]
    fn consumed_records_cannot_match_twice() {
        let groups = correlate(&[
            SourceRecords::new(SourceTag::PnP, vec![pnp(0, "AAA"), pnp(1, "AAA")]),
            SourceRecords::new(SourceTag::DiskDrive, vec![disk(0, "AAA")]),
        ]);
        assert_eq!(groups.len(), 2);
        assert!(!groups[0].records[1].is_placeholder());
        assert!(groups[1].records[1].is_placeholder());
    }

    #[test]
    fn unmatched_anchor_gets_placeholder() {
        let groups = correlate(&[
            SourceRecords::new(SourceTag::PnP, vec![pnp(0, "AAA")]),
            SourceRecords::new(SourceTag::DiskDrive, vec![disk(0, "ZZZ")]),
        ]);
        assert_eq!(groups.len(), 2);
        assert!(groups[0].records[1].is_placeholder());
        assert_eq!(groups[0].records[1].source(), SourceTag::DiskDrive);
        assert_eq!(groups[1].records[0].text(field::SERIAL), Some("ZZZ"));
    }

    #[test]
    fn family_marker_joins_serialless_candidate() {
        let anchor = RawEnumerationRecord::new(SourceTag::PnP, 0)
            .with(field::VENDOR_ID, "0984")
            .with(field::PRODUCT_ID, "1413")
            .with(field::SERIAL, "NVX0001")
            .with(field::DESCRIPTION, "SCSI Mass Storage Device");
        let candidate = RawEnumerationRecord::new(SourceTag::DiskDrive, 0)
            .with(field::DESCRIPTION, "SCSI\\DISK&VEN_APRICORN&PROD_PADLOCK_NVX")
            .with(field::PRODUCT, "Padlock NVX");
        let groups = correlate(&[
            SourceRecords::new(SourceTag::PnP, vec![anchor]),
            SourceRecords::new(SourceTag::DiskDrive, vec![candidate]),
        ]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].tiers, vec![MatchTier::Family]);
    }

    #[test]
    fn vendor_product_joins_serialless_bus_record() {
        let anchor = RawEnumerationRecord::new(SourceTag::PnP, 0)
            .with(field::VENDOR_ID, "0984")
            .with(field::PRODUCT_ID, "1411")
            .with(field::SERIAL, "160050000099");
        let bus = RawEnumerationRecord::new(SourceTag::BusDevice, 0)
            .with(field::VENDOR_ID, "0984")
            .with(field::PRODUCT_ID, "1411")
            .with(field::BCD_DEVICE, "0463");
        let groups = correlate(&[
            SourceRecords::new(SourceTag::PnP, vec![anchor]),
            SourceRecords::new(SourceTag::BusDevice, vec![bus]),
        ]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].tiers, vec![MatchTier::Family]);
        assert_eq!(groups[0].records[1].text(field::BCD_DEVICE), Some("0463"));
    }

    #[test]
    fn family_never_overrides_disagreeing_serials() {
        let anchor = pnp(0, "AAA");
        let candidate = disk(0, "BBB").with(field::PRODUCT, "Secure Key 3.0");
        assert_eq!(
            CorrelationKey::of(&anchor).tier_against(&CorrelationKey::of(&candidate)),
            MatchTier::None
        );
    }

    #[test]
    fn differing_product_ids_are_excluded() {
        let anchor = pnp(0, "AAA");
        let candidate = RawEnumerationRecord::new(SourceTag::BusDevice, 0)
            .with(field::VENDOR_ID, "0984")
            .with(field::PRODUCT_ID, "1410")
            .with(field::SERIAL, "AAA");
        assert_eq!(
            CorrelationKey::of(&anchor).tier_against(&CorrelationKey::of(&candidate)),
            MatchTier::None
        );
    }

    #[test]
    fn more_specific_family_wins() {
        let record = RawEnumerationRecord::new(SourceTag::DiskDrive, 0)
            .with(field::PRODUCT, "Secure Key 3Z");
        assert_eq!(family_of(&record).map(|f| f.name), Some("Secure Key 3Z"));
    }

    #[test]
    fn no_anchor_source_leaves_everything_over() {
        let groups = correlate(&[SourceRecords::new(
            SourceTag::DiskDrive,
            vec![disk(0, "A"), disk(1, "B")],
        )]);
        assert_eq!(groups.len(), 2);
        assert!(groups.iter().all(|group| group.anchor().is_none()));
    }
}
