use crate::DEFAULT_VENDOR_ID;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    pub vendor_id: u16,
    /// Lowercase four-digit product ids that adapters must drop.
    pub excluded_product_ids: Vec<String>,
    /// Skip the controller-association source.
    pub minimal: bool,
    pub query_versions: bool,
    /// Per attempt. Version queries never retry.
    pub query_timeout: Duration,
    /// Pause before the single rescan after inconsistent source counts.
    pub retry_delay: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            vendor_id: DEFAULT_VENDOR_ID,
            excluded_product_ids: Vec::new(),
            minimal: false,
            query_versions: true,
            query_timeout: Duration::from_secs(5),
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl ScanConfig {
    pub fn vendor_hex(&self) -> String {
        format!("{:04x}", self.vendor_id)
    }

    pub fn is_vendor(&self, vendor_id: &str) -> bool {
        u16::from_str_radix(vendor_id.trim().trim_start_matches("0x"), 16)
            .map(|id| id == self.vendor_id)
            .unwrap_or(false)
    }

    pub fn is_excluded(&self, product_id: &str) -> bool {
        let product_id = product_id.trim().to_ascii_lowercase();
        self.excluded_product_ids
            .iter()
            .any(|excluded| excluded.trim().to_ascii_lowercase() == product_id)
    }

    /// Vendor matches and the product is not excluded.
    pub fn accepts(&self, vendor_id: &str, product_id: &str) -> bool {
        self.is_vendor(vendor_id) && !self.is_excluded(product_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_target_the_vendor() {
        let config = ScanConfig::default();
        assert_eq!(config.vendor_hex(), "0984");
        assert!(config.query_versions);
        assert_eq!(config.query_timeout, Duration::from_secs(5));
    }

    #[test]
    fn vendor_match_ignores_case_and_prefix() {
        let config = ScanConfig::default();
        assert!(config.is_vendor("0984"));
        assert!(config.is_vendor("0x0984"));
        assert!(!config.is_vendor("1234"));
        assert!(!config.is_vendor("zz"));
    }

    #[test]
    fn excluded_products_are_rejected() {
        let config = ScanConfig {
            excluded_product_ids: vec!["0221".to_string()],
            ..ScanConfig::default()
        };
        assert!(!config.accepts("0984", "0221"));
        assert!(config.accepts("0984", "1407"));
    }
}
