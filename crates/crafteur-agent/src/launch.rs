use std::ops::RangeInclusive;

pub const MAX_HEAP_FLAG: &str = "-Xmx";
pub const INITIAL_HEAP_FLAG: &str = "-Xms";
pub const RAM_MB_RANGE: RangeInclusive<u32> = 512..=65536;

const DEFAULT_MAX_HEAP_BYTES: u64 = 1024 * 1024 * 1024;

/// JVM flags placed before `-jar <artifact> nogui`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JvmArgs(Vec<String>);

impl Default for JvmArgs {
    fn default() -> Self {
        Self(vec!["-Xmx1G".to_string(), "-Xms1G".to_string()])
    }
}

impl JvmArgs {
    pub fn new(args: Vec<String>) -> Self {
        Self(args)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    /// Replaces every heap flag with a fresh `-Xmx<mb>M -Xms<mb>M` pair; other flags keep their order.
    pub fn set_ram(&mut self, mb: u32) {
        self.0
            .retain(|a| !a.starts_with(MAX_HEAP_FLAG) && !a.starts_with(INITIAL_HEAP_FLAG));
        self.0.push(format!("{MAX_HEAP_FLAG}{mb}M"));
        self.0.push(format!("{INITIAL_HEAP_FLAG}{mb}M"));
    }

    pub fn max_heap_bytes(&self) -> u64 {
        self.0
            .iter()
            .find_map(|a| a.strip_prefix(MAX_HEAP_FLAG))
            .and_then(parse_bytes)
            .unwrap_or(DEFAULT_MAX_HEAP_BYTES)
    }

    pub fn command_args(&self, artifact: &str) -> Vec<String> {
        let mut args = self.0.clone();
        args.push("-jar".to_string());
        args.push(artifact.to_string());
        args.push("nogui".to_string());
        args
    }
}

/// Parses JVM memory sizes such as `2G`, `512m`, `2048K` or a plain byte count.
pub fn parse_bytes(raw: &str) -> Option<u64> {
    let s = raw.trim().to_ascii_uppercase();
    let (digits, multiplier) = if let Some(v) = s.strip_suffix('G') {
        (v, 1024 * 1024 * 1024)
    } else if let Some(v) = s.strip_suffix('M') {
        (v, 1024 * 1024)
    } else if let Some(v) = s.strip_suffix('K') {
        (v, 1024)
    } else {
        (s.as_str(), 1)
    };
    digits.parse::<u64>().ok()?.checked_mul(multiplier)
}

pub fn validate_ram_mb(mb: u32) -> Result<u32, String> {
    if RAM_MB_RANGE.contains(&mb) {
        Ok(mb)
    } else {
        Err(format!(
            "must be between {} and {} (MiB), got {mb}",
            RAM_MB_RANGE.start(),
            RAM_MB_RANGE.end()
        ))
    }
}
