//! Wireless channel lookup through `iw`.

use tokio::process::Command;

/// Channel the interface is tuned to, if it is a wireless interface.
pub async fn channel(if_name: &str) -> Option<u32> {
    let output = Command::new("iw")
        .args(["dev", if_name, "info"])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_iw_channel(&String::from_utf8_lossy(&output.stdout))
}

/// Parse `iw dev <if> info` output.
/// Example line: "\tchannel 36 (5180 MHz), width: 20 MHz, center1: 5180 MHz"
fn parse_iw_channel(output: &str) -> Option<u32> {
    output.lines().find_map(|line| {
        line.trim()
            .strip_prefix("channel ")?
            .split_whitespace()
            .next()?
            .parse()
            .ok()
    })
}
