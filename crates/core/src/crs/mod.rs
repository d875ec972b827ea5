//! Projection identity
//!
//! routedem never reprojects; it only needs to know whether two rasters
//! claim the same projection before aligning them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Coordinate Reference System attached to a raster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CRS {
    /// WKT as stored in the source file
    wkt: Option<String>,
    /// EPSG code, given directly or recovered from the WKT authority
    epsg: Option<u32>,
}

impl CRS {
    /// Create a CRS from an EPSG code
    pub fn from_epsg(code: u32) -> Self {
        Self {
            wkt: None,
            epsg: Some(code),
        }
    }

    /// Create a CRS from a WKT string.
    ///
    /// The EPSG code of the outermost `AUTHORITY["EPSG", "..."]` node (the
    /// last one in the string) is kept when present.
    pub fn from_wkt(wkt: impl Into<String>) -> Self {
        let wkt = wkt.into();
        let epsg = epsg_from_wkt(&wkt);
        Self {
            wkt: Some(wkt),
            epsg,
        }
    }

    pub fn epsg(&self) -> Option<u32> {
        self.epsg
    }

    pub fn wkt(&self) -> Option<&str> {
        self.wkt.as_deref()
    }

    /// Two CRS are equivalent when their EPSG codes match, or failing that,
    /// when their WKT strings match after whitespace normalisation.
    pub fn is_equivalent(&self, other: &CRS) -> bool {
        if let (Some(a), Some(b)) = (self.epsg, other.epsg) {
            return a == b;
        }
        match (&self.wkt, &other.wkt) {
            (Some(a), Some(b)) => normalize(a) == normalize(b),
            _ => false,
        }
    }

    /// Whether the WKT describes a projected (metric) system.
    pub fn is_projected(&self) -> bool {
        match &self.wkt {
            Some(wkt) => {
                let head = wkt.trim_start();
                head.starts_with("PROJCS") || head.starts_with("PROJCRS")
            }
            // UTM zones and web mercator are the common bare-EPSG cases
            None => self
                .epsg
                .map_or(false, |code| code == 3857 || (32601..=32760).contains(&code)),
        }
    }

    /// Short human-readable identifier
    pub fn identifier(&self) -> String {
        if let Some(code) = self.epsg {
            return format!("EPSG:{}", code);
        }
        match &self.wkt {
            Some(wkt) => format!("WKT:{}", &wkt[..wkt.len().min(40)]),
            None => "Unknown".to_string(),
        }
    }
}

fn normalize(wkt: &str) -> String {
    wkt.split_whitespace().collect()
}

fn epsg_from_wkt(wkt: &str) -> Option<u32> {
    let start = wkt.rfind("AUTHORITY[")?;
    let tail = &wkt[start + "AUTHORITY[".len()..];
    let end = tail.find(']')?;
    let mut parts = tail[..end].split(',').map(|p| p.trim().trim_matches('"'));
    match (parts.next(), parts.next()) {
        (Some(auth), Some(code)) if auth.eq_ignore_ascii_case("EPSG") => code.parse().ok(),
        _ => None,
    }
}

impl fmt::Display for CRS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.identifier())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UTM_30N: &str = r#"PROJCS["WGS 84 / UTM zone 30N",GEOGCS["WGS 84",AUTHORITY["EPSG","4326"]],UNIT["metre",1],AUTHORITY["EPSG","32630"]]"#;

    #[test]
    fn test_epsg_recovered_from_wkt() {
        let crs = CRS::from_wkt(UTM_30N);
        assert_eq!(crs.epsg(), Some(32630));
        assert!(crs.is_projected());
        assert_eq!(crs.identifier(), "EPSG:32630");
    }

    #[test]
    fn test_equivalence() {
        assert!(CRS::from_wkt(UTM_30N).is_equivalent(&CRS::from_epsg(32630)));
        assert!(!CRS::from_epsg(4326).is_equivalent(&CRS::from_epsg(32630)));
        assert!(!CRS::from_epsg(4326).is_projected());
    }
}
