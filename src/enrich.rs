//! Document enrichment: GeoIP location and user-agent derived fields.
//!
//! Both steps are optional and infallible. Lookups that fail, private
//! addresses, and unparseable user agents simply leave the document as it is.

use std::net::IpAddr;
use std::path::Path;

use maxminddb::geoip2;
use tracing::{debug, info, warn};
use woothee::parser::Parser;

use crate::event::RawEvent;
use crate::transform::{DeviceInfo, GeoInfo, GeoPoint, IndexedDocument, NameVersion};

const UNKNOWN: &str = "UNKNOWN";

/// Adds geo and user-agent fields when source data is available.
pub struct Enricher {
    geoip: Option<maxminddb::Reader<Vec<u8>>>,
    ua_parser: Parser,
}

impl Enricher {
    /// Build an enricher. A missing or unreadable GeoIP database disables the
    /// geo step; it never fails construction.
    pub fn new(geoip_db_path: Option<&Path>) -> Self {
        let geoip = geoip_db_path.and_then(|path| match maxminddb::Reader::open_readfile(path) {
            Ok(reader) => {
                info!(path = %path.display(), "geoip database loaded");
                Some(reader)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load geoip database");
                None
            }
        });

        Self {
            geoip,
            ua_parser: Parser::new(),
        }
    }

    /// Apply all enrichments in order: geo, then user agent. Idempotent.
    pub fn enrich(&self, document: &mut IndexedDocument, raw: &RawEvent) {
        self.enrich_geoip(document);
        self.enrich_user_agent(document, raw);
    }

    fn enrich_geoip(&self, document: &mut IndexedDocument) {
        let reader = match &self.geoip {
            Some(r) => r,
            None => return,
        };
        let ip = match document.user.as_ref().and_then(|u| u.ip.as_deref()) {
            Some(ip) => ip,
            None => return,
        };
        if is_private_ip(ip) {
            return;
        }
        let addr: IpAddr = match ip.parse() {
            Ok(a) => a,
            Err(_) => return,
        };

        let city: geoip2::City = match reader.lookup(addr) {
            Ok(c) => c,
            Err(e) => {
                debug!(ip = %ip, error = %e, "geoip lookup failed");
                return;
            }
        };

        let mut geo = GeoInfo {
            country_code: city
                .country
                .as_ref()
                .and_then(|c| c.iso_code)
                .map(str::to_string),
            country_name: city
                .country
                .as_ref()
                .and_then(|c| c.names.as_ref())
                .and_then(|n| n.get("en"))
                .map(|s| s.to_string()),
            ..Default::default()
        };

        // Most specific subdivision last, matching the database layout.
        geo.region_name = city
            .subdivisions
            .as_ref()
            .and_then(|subs| subs.last())
            .and_then(|s| s.names.as_ref())
            .and_then(|n| n.get("en"))
            .map(|s| s.to_string());

        geo.city = city
            .city
            .as_ref()
            .and_then(|c| c.names.as_ref())
            .and_then(|n| n.get("en"))
            .map(|s| s.to_string());

        if let Some(location) = city.location.as_ref() {
            if let (Some(lat), Some(lon)) = (location.latitude, location.longitude) {
                geo.location = Some(GeoPoint { lat, lon });
            }
        }

        document.geo = Some(geo);
    }

    fn enrich_user_agent(&self, document: &mut IndexedDocument, raw: &RawEvent) {
        // The SDK-provided contexts win; only fill the gaps.
        if document.browser.is_some() && document.os.is_some() {
            return;
        }
        let user_agent = match raw.user_agent() {
            Some(ua) if !ua.is_empty() => ua,
            _ => return,
        };
        let parsed = match self.ua_parser.parse(user_agent) {
            Some(p) => p,
            None => return,
        };

        if document.browser.is_none() && parsed.name != UNKNOWN {
            document.browser = Some(NameVersion {
                name: Some(parsed.name.to_string()),
                version: known(&parsed.version.to_string()),
            });
        }

        if document.os.is_none() && parsed.os != UNKNOWN {
            document.os = Some(NameVersion {
                name: Some(parsed.os.to_string()),
                version: known(&parsed.os_version.to_string()),
            });
        }

        if document.device.is_none() && parsed.category != UNKNOWN {
            document.device = Some(DeviceInfo {
                family: Some(parsed.category.to_string()),
                brand: known(&parsed.vendor.to_string()),
                model: None,
            });
        }
    }
}

fn known(value: &str) -> Option<String> {
    if value.is_empty() || value == UNKNOWN {
        None
    } else {
        Some(value.to_string())
    }
}

/// Private/local address check. The `172.` prefix is intentionally coarser
/// than the RFC 1918 `172.16/12` block.
fn is_private_ip(ip: &str) -> bool {
    if ip.is_empty() || ip == "localhost" {
        return true;
    }
    ip.starts_with("10.")
        || ip.starts_with("172.")
        || ip.starts_with("192.168.")
        || ip.starts_with("127.")
        || ip.starts_with("::1")
        || ip.starts_with("fe80:")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event;
    use crate::transform::Transformer;

    fn enriched(payload: &[u8]) -> IndexedDocument {
        let raw = event::decode(payload);
        let mut doc = Transformer::new().transform(&raw, 1);
        Enricher::new(None).enrich(&mut doc, &raw);
        doc
    }

    const FIREFOX_LINUX: &str =
        "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0";

    #[test]
    fn private_ip_detection() {
        assert!(is_private_ip("10.0.0.1"));
        assert!(is_private_ip("172.20.1.1"));
        assert!(is_private_ip("172.99.1.1")); // coarse on purpose
        assert!(is_private_ip("192.168.1.1"));
        assert!(is_private_ip("127.0.0.1"));
        assert!(is_private_ip("::1"));
        assert!(is_private_ip("fe80::1"));
        assert!(is_private_ip("localhost"));
        assert!(is_private_ip(""));
        assert!(!is_private_ip("8.8.8.8"));
        assert!(!is_private_ip("203.0.113.9"));
    }

    #[test]
    fn user_agent_fills_browser_and_os() {
        let payload = format!(
            r#"{{"request":{{"headers":{{"User-Agent":"{FIREFOX_LINUX}"}}}}}}"#
        );
        let doc = enriched(payload.as_bytes());

        let browser = doc.browser.expect("browser filled from user agent");
        assert_eq!(browser.name.as_deref(), Some("Firefox"));
        let os = doc.os.expect("os filled from user agent");
        assert_eq!(os.name.as_deref(), Some("Linux"));
    }

    #[test]
    fn sdk_contexts_are_not_overwritten() {
        let payload = format!(
            r#"{{"contexts":{{"browser":{{"name":"Chrome","version":"120"}},"os":{{"name":"Windows"}}}},
                "request":{{"headers":{{"User-Agent":"{FIREFOX_LINUX}"}}}}}}"#
        );
        let doc = enriched(payload.as_bytes());
        assert_eq!(doc.browser.unwrap().name.as_deref(), Some("Chrome"));
        assert_eq!(doc.os.unwrap().name.as_deref(), Some("Windows"));
    }

    #[test]
    fn missing_user_agent_leaves_document_untouched() {
        let doc = enriched(br#"{"message":"hello"}"#);
        assert!(doc.browser.is_none());
        assert!(doc.os.is_none());
        assert!(doc.device.is_none());
        assert!(doc.geo.is_none());
    }

    #[test]
    fn no_geo_without_database() {
        let doc = enriched(br#"{"user":{"ip_address":"8.8.8.8"}}"#);
        assert!(doc.geo.is_none());
    }

    #[test]
    fn enrich_is_idempotent() {
        let raw = event::decode(
            format!(r#"{{"request":{{"headers":{{"User-Agent":"{FIREFOX_LINUX}"}}}}}}"#).as_bytes(),
        );
        let enricher = Enricher::new(None);
        let mut doc = Transformer::new().transform(&raw, 1);
        enricher.enrich(&mut doc, &raw);
        let first = doc.clone();
        enricher.enrich(&mut doc, &raw);
        assert_eq!(doc.browser, first.browser);
        assert_eq!(doc.os, first.os);
        assert_eq!(doc.device, first.device);
    }

    #[test]
    fn nonexistent_database_path_disables_geo() {
        let enricher = Enricher::new(Some(Path::new("/nonexistent/GeoLite2-City.mmdb")));
        let raw = event::decode(br#"{"user":{"ip_address":"8.8.8.8"}}"#);
        let mut doc = Transformer::new().transform(&raw, 1);
        enricher.enrich(&mut doc, &raw);
        assert!(doc.geo.is_none());
    }
}
