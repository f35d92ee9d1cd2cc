//! Nominal capacity lookup for known products.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Capacity {
    /// Marketed size in GB.
    Nominal(u64),
    /// Enumerated without usable media (unformatted or out-of-box mode).
    OutOfBand,
}

impl fmt::Display for Capacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capacity::Nominal(gb) => write!(f, "{}", gb),
            Capacity::OutOfBand => f.write_str("N/A (OOB Mode)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    /// Four lowercase hex digits: a product id or a bcdDevice code.
    pub key: String,
    pub name: String,
    /// Capacities in GB, in declaration order.
    pub sizes_gb: Vec<u64>,
}

impl CatalogEntry {
    pub fn new(key: &str, name: &str, sizes_gb: &[u64]) -> Self {
        Self {
            key: key.to_ascii_lowercase(),
            name: name.to_string(),
            sizes_gb: sizes_gb.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SizeCatalog {
    entries: Vec<CatalogEntry>,
}

const BUILTIN: &[(&str, &str, &[u64])] = &[
    ("0310", "Padlock 3.0", &[256, 500, 1000, 2000, 4000, 8000, 16000]),
    (
        "0315",
        "Padlock DT",
        &[2000, 4000, 6000, 8000, 10000, 12000, 16000, 18000, 20000, 22000, 24000],
    ),
    ("0351", "Aegis Portable", &[128, 256, 500, 1000, 2000, 4000, 8000, 12000, 16000]),
    ("1400", "Fortress", &[256, 500, 1000, 2000, 4000, 8000, 16000]),
    ("1405", "Padlock SSD", &[240, 480, 1000, 2000, 4000]),
    (
        "1406",
        "Padlock DT FIPS",
        &[2000, 4000, 6000, 8000, 10000, 12000, 16000, 18000, 20000, 22000, 24000],
    ),
    ("1407", "Secure Key 3.0", &[16, 30, 60, 120, 240, 480, 1000, 2000, 4000]),
    ("1408", "Fortress L3", &[500, 512, 1000, 2000, 4000, 5000, 8000, 16000, 20000]),
    ("1409", "Secure Key 3.0", &[16, 32, 64, 128, 256, 500, 1000, 2000, 4000]),
    ("1410", "Secure Key 3Z", &[4, 8, 16, 32, 64, 128, 256, 512]),
    ("1413", "Padlock NVX", &[500, 1000, 2000, 4000]),
];

impl SizeCatalog {
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        Self { entries }
    }

    /// The vendor's product table, built on first use and shared read-only.
    pub fn builtin() -> &'static SizeCatalog {
        static CATALOG: OnceLock<SizeCatalog> = OnceLock::new();
        CATALOG.get_or_init(|| {
            SizeCatalog::new(
                BUILTIN
                    .iter()
                    .map(|(key, name, sizes)| CatalogEntry::new(key, name, sizes))
                    .collect(),
            )
        })
    }

    pub fn entry(&self, key: &str) -> Option<&CatalogEntry> {
        let key = key.trim().to_ascii_lowercase();
        self.entries.iter().find(|entry| entry.key == key)
    }

    /// Capacities registered for the product id, falling back to the bcdDevice code.
    pub fn sizes_for(&self, product_id: &str, bcd_device: &str) -> &[u64] {
        [product_id, bcd_device]
            .into_iter()
            .filter_map(|key| self.entry(key))
            .map(|entry| entry.sizes_gb.as_slice())
            .find(|sizes| !sizes.is_empty())
            .unwrap_or(&[])
    }

    pub fn normalize(&self, raw_gb: Option<f64>, product_id: &str, bcd_device: &str) -> Capacity {
        normalize_capacity(raw_gb, self.sizes_for(product_id, bcd_device))
    }
}

/// Snaps a raw capacity onto the nearest catalog value.
///
/// Equidistant candidates resolve to the one declared first. With no
/// candidates the raw value is rounded. Zero or missing capacity is
/// out-of-band.
pub fn normalize_capacity(raw_gb: Option<f64>, sizes_gb: &[u64]) -> Capacity {
    let raw = match raw_gb {
        Some(value) if value.is_finite() && value > 0.0 => value,
        _ => return Capacity::OutOfBand,
    };
    let mut best: Option<(u64, f64)> = None;
    for &size in sizes_gb {
        let distance = (size as f64 - raw).abs();
        match best {
            Some((_, best_distance)) if distance >= best_distance => {}
            _ => best = Some((size, distance)),
        }
    }
    match best {
        Some((size, _)) => Capacity::Nominal(size),
        None => Capacity::Nominal(raw.round() as u64),
    }
}

pub fn bytes_to_gb(bytes: u64) -> f64 {
    bytes as f64 / (1024u64 * 1024 * 1024) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snaps_to_nearest_catalog_size() {
        assert_eq!(normalize_capacity(Some(14.62), &[16, 30, 60]), Capacity::Nominal(16));
        assert_eq!(normalize_capacity(Some(57.3), &[16, 30, 60]), Capacity::Nominal(60));
    }

    #[test]
    fn equidistant_prefers_first_declared() {
        assert_eq!(normalize_capacity(Some(23.0), &[16, 30]), Capacity::Nominal(16));
        assert_eq!(normalize_capacity(Some(23.0), &[30, 16]), Capacity::Nominal(30));
    }

    #[test]
    fn rounds_without_catalog() {
        assert_eq!(normalize_capacity(Some(14.62), &[]), Capacity::Nominal(15));
    }

    #[test]
    fn zero_or_missing_is_out_of_band() {
        assert_eq!(normalize_capacity(Some(0.0), &[16]), Capacity::OutOfBand);
        assert_eq!(normalize_capacity(None, &[16]), Capacity::OutOfBand);
        assert_eq!(Capacity::OutOfBand.to_string(), "N/A (OOB Mode)");
    }

    #[test]
    fn falls_back_to_bcd_device_entry() {
        let catalog = SizeCatalog::new(vec![CatalogEntry::new("0463", "Bridge", &[500, 1000])]);
        assert_eq!(catalog.sizes_for("9999", "0463"), &[500, 1000]);
        assert_eq!(catalog.normalize(Some(931.5), "9999", "0463"), Capacity::Nominal(1000));
        assert!(catalog.sizes_for("9999", "8888").is_empty());
    }

    #[test]
    fn builtin_catalog_is_keyed_by_product_id() {
        let catalog = SizeCatalog::builtin();
        assert_eq!(catalog.entry("1407").map(|e| e.name.as_str()), Some("Secure Key 3.0"));
        assert_eq!(catalog.normalize(Some(14.62), "1407", "0502"), Capacity::Nominal(16));
    }

    #[test]
    fn converts_bytes_to_gib() {
        assert_eq!(bytes_to_gb(1024 * 1024 * 1024), 1.0);
    }
}
