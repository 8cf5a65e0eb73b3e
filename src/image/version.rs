// file: src/image/version.rs
// version: 1.0.0
// guid: 2c7e9a41-5b3d-4f68-8a1c-9d0e2f3a4b5c

//! Image version numbers

use crate::error::CloudImagesError;
use chrono::NaiveDate;
use std::fmt;
use std::str::FromStr;

/// Build version: optional build date plus a serial number.
///
/// The string form is `YYYYMMDD-N` or just `N`. Versions order by date
/// first, undated versions sorting before any dated one, then by serial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ImageVersion {
    pub date: Option<NaiveDate>,
    pub build: u32,
}

impl ImageVersion {
    pub fn new(date: Option<NaiveDate>, build: u32) -> Self {
        Self { date, build }
    }

    pub fn from_string(s: &str) -> Result<Self, CloudImagesError> {
        s.parse()
    }
}

impl FromStr for ImageVersion {
    type Err = CloudImagesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CloudImagesError::validation(format!("Invalid image version: {}", s));

        let (date, build) = match s.split_once('-') {
            Some((date, build)) => {
                if date.len() != 8 || !date.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(invalid());
                }
                let date = NaiveDate::parse_from_str(date, "%Y%m%d").map_err(|_| invalid())?;
                (Some(date), build)
            }
            None => (None, s),
        };

        if build.is_empty() || !build.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        // Leading zeros would not survive a round trip
        if build.len() > 1 && build.starts_with('0') {
            return Err(invalid());
        }
        let build = build.parse().map_err(|_| invalid())?;

        Ok(Self { date, build })
    }
}

impl fmt::Display for ImageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.date {
            Some(date) => write!(f, "{}-{}", date.format("%Y%m%d"), self.build),
            None => write!(f, "{}", self.build),
        }
    }
}

/// Azure gallery image version `major.minor.patch`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AzureImageVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl AzureImageVersion {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Map `YYYYMMDD-N` to `0.YYYYMMDD.N` and `N` to `0.0.N`
    pub fn from_image_version(version: &ImageVersion) -> Self {
        let minor = version
            .date
            .map(|date| {
                date.format("%Y%m%d")
                    .to_string()
                    .parse()
                    .unwrap_or_default()
            })
            .unwrap_or(0);
        Self::new(0, minor, version.build)
    }
}

impl FromStr for AzureImageVersion {
    type Err = CloudImagesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CloudImagesError::validation(format!("Invalid Azure image version: {}", s));
        let parts: Vec<u32> = s
            .split('.')
            .map(|p| p.parse::<u32>().map_err(|_| invalid()))
            .collect::<Result<_, _>>()?;
        match parts[..] {
            [major, minor, patch] => Ok(Self::new(major, minor, patch)),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for AzureImageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_puts_undated_first() {
        let newer = ImageVersion::from_string("20240823-1848").unwrap();
        let older = ImageVersion::from_string("20240701-1001").unwrap();
        let undated = ImageVersion::from_string("1001").unwrap();

        assert!(newer > older);
        assert!(older > undated);
        assert!(ImageVersion::from_string("20240701-1002").unwrap() > older);
    }

    #[test]
    fn test_string_round_trip() {
        for s in ["20240904-1860", "1", "19991231-0", "42"] {
            assert_eq!(ImageVersion::from_string(s).unwrap().to_string(), s);
        }
    }

    #[test]
    fn test_rejects_malformed() {
        for s in ["", "abc", "2024-1", "20241340-1", "20240101-", "20240101-x", "007"] {
            assert!(ImageVersion::from_string(s).is_err(), "accepted {:?}", s);
        }
    }

    #[test]
    fn test_azure_version_mapping() {
        let dated = ImageVersion::from_string("20240904-1860").unwrap();
        assert_eq!(
            AzureImageVersion::from_image_version(&dated).to_string(),
            "0.20240904.1860"
        );

        let undated = ImageVersion::from_string("5").unwrap();
        assert_eq!(AzureImageVersion::from_image_version(&undated), AzureImageVersion::new(0, 0, 5));
    }

    #[test]
    fn test_azure_version_order_is_numeric() {
        let a: AzureImageVersion = "0.20240904.9".parse().unwrap();
        let b: AzureImageVersion = "0.20240904.10".parse().unwrap();
        assert!(b > a);
        assert!("1.2".parse::<AzureImageVersion>().is_err());
    }
}
