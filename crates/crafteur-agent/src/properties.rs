//! Flat `key=value` server configuration (`server.properties`).

use std::{collections::BTreeMap, io, ops::RangeInclusive, path::Path};

use chrono::{DateTime, Local};

pub const FILE_NAME: &str = "server.properties";
pub const PORT_KEY: &str = "server-port";
pub const PORT_RANGE: RangeInclusive<u16> = 1024..=65535;

pub type Properties = BTreeMap<String, String>;

/// Blank lines, `#` comments and lines without `=` are ignored; later keys win.
pub fn parse(text: &str) -> Properties {
    let mut props = Properties::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            props.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    props
}

pub fn render(props: &Properties, at: DateTime<Local>) -> String {
    let mut out = String::from("#Minecraft server properties\n");
    out.push('#');
    out.push_str(&at.format("%a %b %d %H:%M:%S %Z %Y").to_string());
    out.push('\n');
    for (k, v) in props {
        out.push_str(k);
        out.push('=');
        out.push_str(v);
        out.push('\n');
    }
    out
}

/// A missing file reads as empty.
pub async fn load(path: &Path) -> io::Result<Properties> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(parse(&text)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Properties::new()),
        Err(e) => Err(e),
    }
}

pub async fn save(path: &Path, props: &Properties) -> io::Result<()> {
    let tmp = path.with_extension("properties.tmp");
    tokio::fs::write(&tmp, render(props, Local::now())).await?;
    tokio::fs::rename(&tmp, path).await
}

pub fn validate_port(raw: &str) -> Result<u16, String> {
    let port: u16 = raw
        .trim()
        .parse()
        .map_err(|_| format!("must be a number, got {raw:?}"))?;
    if !PORT_RANGE.contains(&port) {
        return Err(format!(
            "must be between {} and {}, got {port}",
            PORT_RANGE.start(),
            PORT_RANGE.end()
        ));
    }
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_skips_comments_and_junk() {
        let props = parse("#header\n\nmotd = A Server \nserver-port=25565\nnot a pair\nmotd=Again\n");
        assert_eq!(props.len(), 2);
        assert_eq!(props["motd"], "Again");
        assert_eq!(props[PORT_KEY], "25565");
    }

    #[test]
    fn render_sorts_keys_after_header() {
        let mut props = Properties::new();
        props.insert("server-port".into(), "25570".into());
        props.insert("difficulty".into(), "hard".into());
        let text = render(&props, Local::now());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "#Minecraft server properties");
        assert!(lines[1].starts_with('#'));
        assert_eq!(&lines[2..], ["difficulty=hard", "server-port=25570"]);
    }

    #[tokio::test]
    async fn missing_file_is_empty_and_save_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(FILE_NAME);
        assert!(load(&path).await.unwrap().is_empty());

        let mut props = Properties::new();
        props.insert("level-name".into(), "world".into());
        save(&path, &props).await.unwrap();
        assert_eq!(load(&path).await.unwrap(), props);
        assert!(!dir.path().join("server.properties.tmp").exists());
    }

    #[test]
    fn port_bounds() {
        assert_eq!(validate_port("25565"), Ok(25565));
        assert!(validate_port("80").is_err());
        assert!(validate_port("http").is_err());
        assert!(validate_port("70000").is_err());
    }
}
