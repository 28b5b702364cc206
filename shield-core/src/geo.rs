//! Country resolution for the WAF's geo-blocking check.
//!
//! Header priority (cheapest first): `CF-IPCountry`, then
//! `X-Country-Code`, then an optional local MaxMind database lookup.

use std::collections::HashMap;
use std::path::Path;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

pub static COUNTRY_MAP: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("AF", "Afghanistan"), ("AL", "Albania"), ("DZ", "Algeria"), ("AS", "American Samoa"),
        ("AD", "Andorra"), ("AO", "Angola"), ("AG", "Antigua and Barbuda"), ("AR", "Argentina"),
        ("AM", "Armenia"), ("AU", "Australia"), ("AT", "Austria"), ("AZ", "Azerbaijan"),
        ("BS", "Bahamas"), ("BH", "Bahrain"), ("BD", "Bangladesh"), ("BB", "Barbados"),
        ("BY", "Belarus"), ("BE", "Belgium"), ("BZ", "Belize"), ("BJ", "Benin"),
        ("BT", "Bhutan"), ("BO", "Bolivia"), ("BA", "Bosnia and Herzegovina"), ("BW", "Botswana"),
        ("BR", "Brazil"), ("BN", "Brunei"), ("BG", "Bulgaria"), ("BF", "Burkina Faso"),
        ("BI", "Burundi"), ("KH", "Cambodia"), ("CM", "Cameroon"), ("CA", "Canada"),
        ("CN", "China"), ("CO", "Colombia"), ("CR", "Costa Rica"), ("HR", "Croatia"),
        ("CU", "Cuba"), ("CY", "Cyprus"), ("CZ", "Czech Republic"), ("DK", "Denmark"),
        ("DO", "Dominican Republic"), ("EC", "Ecuador"), ("EG", "Egypt"), ("SV", "El Salvador"),
        ("EE", "Estonia"), ("ET", "Ethiopia"), ("FI", "Finland"), ("FR", "France"),
        ("DE", "Germany"), ("GH", "Ghana"), ("GR", "Greece"), ("GT", "Guatemala"),
        ("HT", "Haiti"), ("HN", "Honduras"), ("HK", "Hong Kong"), ("HU", "Hungary"),
        ("IS", "Iceland"), ("IN", "India"), ("ID", "Indonesia"), ("IR", "Iran"),
        ("IQ", "Iraq"), ("IE", "Ireland"), ("IL", "Israel"), ("IT", "Italy"),
        ("JM", "Jamaica"), ("JP", "Japan"), ("JO", "Jordan"), ("KZ", "Kazakhstan"),
        ("KE", "Kenya"), ("KP", "North Korea"), ("KR", "South Korea"), ("KW", "Kuwait"),
        ("LA", "Laos"), ("LV", "Latvia"), ("LB", "Lebanon"), ("LY", "Libya"),
        ("LT", "Lithuania"), ("LU", "Luxembourg"), ("MY", "Malaysia"), ("MX", "Mexico"),
        ("MD", "Moldova"), ("MN", "Mongolia"), ("MA", "Morocco"), ("MM", "Myanmar"),
        ("NP", "Nepal"), ("NL", "Netherlands"), ("NZ", "New Zealand"), ("NI", "Nicaragua"),
        ("NG", "Nigeria"), ("NO", "Norway"), ("PK", "Pakistan"), ("PA", "Panama"),
        ("PY", "Paraguay"), ("PE", "Peru"), ("PH", "Philippines"), ("PL", "Poland"),
        ("PT", "Portugal"), ("QA", "Qatar"), ("RO", "Romania"), ("RU", "Russia"),
        ("SA", "Saudi Arabia"), ("RS", "Serbia"), ("SG", "Singapore"), ("SK", "Slovakia"),
        ("SI", "Slovenia"), ("ZA", "South Africa"), ("ES", "Spain"), ("LK", "Sri Lanka"),
        ("SD", "Sudan"), ("SE", "Sweden"), ("CH", "Switzerland"), ("SY", "Syria"),
        ("TW", "Taiwan"), ("TZ", "Tanzania"), ("TH", "Thailand"), ("TN", "Tunisia"),
        ("TR", "Turkey"), ("UA", "Ukraine"), ("AE", "United Arab Emirates"),
        ("GB", "United Kingdom"), ("US", "United States"), ("UY", "Uruguay"),
        ("UZ", "Uzbekistan"), ("VE", "Venezuela"), ("VN", "Vietnam"), ("YE", "Yemen"),
        ("ZM", "Zambia"), ("ZW", "Zimbabwe"),
    ])
});

pub static HIGH_RISK_COUNTRIES: &[&str] =
    &["CN", "RU", "KP", "IR", "NG", "PK", "BD", "VN", "UA", "IN", "ID", "BR", "TH", "RO", "BG"];

/// Resolves client country codes, optionally backed by a MaxMind GeoLite2
/// country database. Lookups are cached since the same attacker IP is
/// typically seen many times in a short window.
pub struct GeoResolver {
    reader: Option<maxminddb::Reader<Vec<u8>>>,
    cache: Mutex<HashMap<String, Option<String>>>,
}

impl GeoResolver {
    pub fn disabled() -> Self {
        GeoResolver { reader: None, cache: Mutex::new(HashMap::new()) }
    }

    /// Opens a MaxMind database; returns a disabled resolver if the file is
    /// missing or malformed rather than failing Shield startup over it.
    pub fn open(db_path: &Path) -> Self {
        match maxminddb::Reader::open_readfile(db_path) {
            Ok(reader) => GeoResolver { reader: Some(reader), cache: Mutex::new(HashMap::new()) },
            Err(_) => GeoResolver::disabled(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.reader.is_some()
    }

    fn lookup_ip(&self, ip: &str) -> Option<String> {
        let reader = self.reader.as_ref()?;
        if let Some(cached) = self.cache.lock().get(ip) {
            return cached.clone();
        }

        let addr: std::net::IpAddr = ip.parse().ok()?;
        let result: Option<maxminddb::geoip2::Country> = reader.lookup(addr).ok().flatten();
        let code = result
            .and_then(|c| c.country)
            .and_then(|c| c.iso_code)
            .map(|s| s.to_string());

        self.cache.lock().insert(ip.to_string(), code.clone());
        code
    }

    /// Resolves the country for a request: `CF-IPCountry` header first,
    /// then `X-Country-Code`, then the local database.
    pub fn resolve(&self, cf_ipcountry: Option<&str>, x_country_code: Option<&str>, client_ip: &str) -> Option<String> {
        if let Some(cf) = cf_ipcountry {
            let upper = cf.to_uppercase();
            if upper != "XX" && upper != "T1" {
                return Some(upper);
            }
        }

        if let Some(x) = x_country_code {
            if x.len() == 2 {
                return Some(x.to_uppercase());
            }
        }

        self.lookup_ip(client_ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_resolver_falls_through_to_none() {
        let geo = GeoResolver::disabled();
        assert_eq!(geo.resolve(None, None, "1.2.3.4"), None);
    }

    #[test]
    fn cf_header_takes_priority() {
        let geo = GeoResolver::disabled();
        assert_eq!(geo.resolve(Some("us"), Some("DE"), "1.2.3.4"), Some("US".to_string()));
    }

    #[test]
    fn cf_unknown_code_falls_through() {
        let geo = GeoResolver::disabled();
        assert_eq!(geo.resolve(Some("xx"), Some("de"), "1.2.3.4"), Some("DE".to_string()));
    }

    #[test]
    fn invalid_x_country_code_length_ignored() {
        let geo = GeoResolver::disabled();
        assert_eq!(geo.resolve(None, Some("usa"), "1.2.3.4"), None);
    }

    #[test]
    fn country_map_has_common_entries() {
        assert_eq!(COUNTRY_MAP.get("US"), Some(&"United States"));
        assert!(HIGH_RISK_COUNTRIES.contains(&"CN"));
    }
}
