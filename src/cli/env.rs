use std::io::Write;

use anyhow::Result;

use crate::config::ReportTo;

/// Write the details worth pasting into a bug report.
pub fn print_env(out: &mut dyn Write) -> Result<()> {
    let parallelism = std::thread::available_parallelism().map_or(1, |n| n.get());
    let profile = if cfg!(debug_assertions) { "debug" } else { "release" };
    let integrations = ReportTo::AVAILABLE
        .iter()
        .map(|sink| sink.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "not set".to_string());

    writeln!(out)?;
    writeln!(out, "Copy-paste the following information when reporting an issue:")?;
    writeln!(out)?;
    writeln!(out, "- Platform: {}-{} ({})", std::env::consts::OS, std::env::consts::ARCH, std::env::consts::FAMILY)?;
    writeln!(out, "- TRL version: {}", env!("CARGO_PKG_VERSION"))?;
    writeln!(out, "- Build profile: {profile}")?;
    writeln!(out, "- Available parallelism: {parallelism}")?;
    writeln!(out, "- Model backend: tiny (built-in, f32)")?;
    writeln!(out, "- Reporting integrations: {integrations}")?;
    writeln!(out, "- RUST_LOG: {rust_log}")?;
    writeln!(out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_report_mentions_version() {
        let mut out = Vec::new();
        print_env(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("TRL version: "));
        assert!(text.contains("jsonl, tracing"));
    }
}
