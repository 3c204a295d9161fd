//! Configuration parameter validation.

use color_eyre::Result;

use nbd_client::config::{Config, Endpoint};

#[test]
fn rejects_mixed_endpoints() {
    let mut config = Config::default();
    config.set("socket", "/run/nbd.sock").unwrap();
    config.set("hostname", "example.org").unwrap();
    assert!(config.finish().is_err());
}

#[test]
fn rejects_port_with_a_socket() {
    let mut config = Config::default();
    config.set("socket", "/run/nbd.sock").unwrap();
    config.set("port", "10809").unwrap();
    assert!(config.finish().is_err());
}

#[test]
fn rejects_missing_endpoint() {
    let mut config = Config::default();
    config.set("export", "disk").unwrap();
    assert!(config.finish().is_err());
}

#[test]
fn rejects_unknown_keys() {
    let mut config = Config::default();
    assert!(config.set("sockname", "/run/nbd.sock").is_err());
}

#[test]
fn default_port_applies() -> Result<()> {
    let mut config = Config::default();
    config.set("hostname", "example.org")?;
    let settings = config.finish()?;
    assert_eq!(settings.server, "example.org:10809");
    match settings.endpoint {
        Endpoint::Tcp { host, port } => {
            assert_eq!(host, "example.org");
            assert_eq!(port, "10809");
        }
        Endpoint::Unix(_) => panic!("expected a TCP endpoint"),
    }
    assert_eq!(settings.export, "");
    assert_eq!(settings.retry, 0);
    assert!(!settings.shared);
    Ok(())
}

#[test]
fn ipv6_hostnames_are_bracketed_in_the_server_name() -> Result<()> {
    let mut config = Config::default();
    config.set("hostname", "::1")?;
    config.set("port", "nbd")?;
    let settings = config.finish()?;
    assert_eq!(settings.server, "[::1]:nbd");
    Ok(())
}

#[test]
fn parses_booleans_like_the_original() -> Result<()> {
    for value in ["1", "true", "TRUE", "on", "yes"] {
        let mut config = Config::default();
        config.set("shared", value)?;
        assert!(config.shared, "{value} should parse as true");
    }
    for value in ["0", "false", "off", "NO"] {
        let mut config = Config::default();
        config.set("shared", value)?;
        assert!(!config.shared, "{value} should parse as false");
    }
    let mut config = Config::default();
    assert!(config.set("shared", "maybe").is_err());
    Ok(())
}

#[test]
fn rejects_unparseable_retry() {
    let mut config = Config::default();
    assert!(config.set("retry", "soon").is_err());
    config.set("retry", "3").unwrap();
    assert_eq!(config.retry, 3);
}

#[test]
fn rejects_oversized_socket_paths() {
    let mut config = Config::default();
    let path = format!("/{}", "x".repeat(300));
    config.set("socket", &path).unwrap();
    assert!(config.finish().is_err());
}

#[test]
fn relative_socket_paths_become_absolute() -> Result<()> {
    let mut config = Config::default();
    config.set("socket", "nbd.sock")?;
    let settings = config.finish()?;
    match settings.endpoint {
        Endpoint::Unix(path) => assert!(path.is_absolute()),
        Endpoint::Tcp { .. } => panic!("expected a Unix endpoint"),
    }
    Ok(())
}
