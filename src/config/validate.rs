//! Field format checks.

use regex::Regex;
use std::net::Ipv4Addr;
use std::sync::OnceLock;

use crate::error::ConfigError;

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).unwrap_or_else(|e| panic!("bad pattern {pattern}: {e}")))
}

fn invalid(field: &'static str, value: &str, expected: &'static str) -> ConfigError {
    ConfigError::InvalidFormat {
        field,
        value: value.to_string(),
        expected,
    }
}

/// `x.y.z`
pub fn semantic_version(field: &'static str, value: &str) -> Result<(), ConfigError> {
    static RE: OnceLock<Regex> = OnceLock::new();
    if regex(&RE, r"^\d+\.\d+\.\d+$").is_match(value) {
        Ok(())
    } else {
        Err(invalid(field, value, "semantic version x.y.z"))
    }
}

/// `vX.Y.Z+buildtag`, e.g. `v1.28.4+k3s1`
pub fn runtime_version(field: &'static str, value: &str) -> Result<(), ConfigError> {
    static RE: OnceLock<Regex> = OnceLock::new();
    if regex(&RE, r"^v\d+\.\d+\.\d+\+[A-Za-z0-9.]+$").is_match(value) {
        Ok(())
    } else {
        Err(invalid(field, value, "runtime version vX.Y.Z+buildtag"))
    }
}

/// `distribution:major.minor[.patch]` split into its two halves.
pub fn base_image(field: &'static str, value: &str) -> Result<(String, String), ConfigError> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let caps = regex(&RE, r"^([a-z][a-z0-9-]*):(\d+\.\d+(?:\.\d+)?)$")
        .captures(value)
        .ok_or_else(|| invalid(field, value, "distribution:major.minor[.patch]"))?;
    Ok((caps[1].to_string(), caps[2].to_string()))
}

pub fn template_name(field: &'static str, value: &str) -> Result<(), ConfigError> {
    static RE: OnceLock<Regex> = OnceLock::new();
    if regex(&RE, r"^[a-z0-9][a-z0-9-]{0,62}$").is_match(value) {
        Ok(())
    } else {
        Err(invalid(field, value, "lowercase letters, digits and '-'"))
    }
}

pub fn architecture(field: &'static str, value: &str) -> Result<(), ConfigError> {
    static RE: OnceLock<Regex> = OnceLock::new();
    if regex(&RE, r"^[a-z0-9_]+$").is_match(value) {
        Ok(())
    } else {
        Err(invalid(field, value, "architecture identifier such as amd64"))
    }
}

/// RFC 1123 label; also used for interface and service names.
pub fn hostname(field: &'static str, value: &str) -> Result<(), ConfigError> {
    static RE: OnceLock<Regex> = OnceLock::new();
    if regex(&RE, r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?$").is_match(value) {
        Ok(())
    } else {
        Err(invalid(field, value, "RFC 1123 hostname label"))
    }
}

pub fn package_name(field: &'static str, value: &str) -> Result<(), ConfigError> {
    static RE: OnceLock<Regex> = OnceLock::new();
    if regex(&RE, r"^[A-Za-z0-9][A-Za-z0-9+._@=<>~-]*$").is_match(value) {
        Ok(())
    } else {
        Err(invalid(field, value, "package name"))
    }
}

/// IPv4 CIDR `a.b.c.d/n`.
pub fn cidr(field: &'static str, value: &str) -> Result<(), ConfigError> {
    let expected = "IPv4 CIDR a.b.c.d/n";
    let (addr, prefix) = value
        .split_once('/')
        .ok_or_else(|| invalid(field, value, expected))?;
    addr.parse::<Ipv4Addr>()
        .map_err(|_| invalid(field, value, expected))?;
    match prefix.parse::<u8>() {
        Ok(p) if p <= 32 => Ok(()),
        _ => Err(invalid(field, value, expected)),
    }
}

pub fn mirror_url(field: &'static str, value: &str) -> Result<(), ConfigError> {
    let ok = ["http://", "https://", "file://"]
        .iter()
        .any(|scheme| value.starts_with(scheme) && value.len() > scheme.len());
    if ok {
        Ok(())
    } else {
        Err(invalid(field, value, "http://, https:// or file:// URL"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_semantic_version() {
        assert!(semantic_version("v", "1.0.0").is_ok());
        assert!(semantic_version("v", "1.0").is_err());
        assert!(semantic_version("v", "v1.0.0").is_err());
    }

    #[test]
    fn test_runtime_version() {
        assert!(runtime_version("r", "v1.28.4+k3s1").is_ok());
        assert!(runtime_version("r", "1.28.4+k3s1").is_err());
        assert!(runtime_version("r", "v1.28.4").is_err());
    }

    #[test]
    fn test_base_image_split() {
        let (dist, ver) = base_image("b", "alpine:3.18").unwrap();
        assert_eq!(dist, "alpine");
        assert_eq!(ver, "3.18");
        assert!(base_image("b", "alpine").is_err());
        assert!(base_image("b", "alpine:latest").is_err());
    }

    #[test]
    fn test_cidr() {
        assert!(cidr("c", "10.42.0.0/16").is_ok());
        assert!(cidr("c", "10.42.0.0/33").is_err());
        assert!(cidr("c", "10.42.0.0").is_err());
        assert!(cidr("c", "banana/8").is_err());
    }

    #[test]
    fn test_invalid_format_names_field() {
        let err = template_name("template.name", "Bad Name").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("template.name"));
        assert!(msg.contains("Bad Name"));
    }
}
