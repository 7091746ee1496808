use std::path::Path;

use anyhow::Result;

use crate::core::Finding;
use crate::platform::{self, OsFamily};
use crate::rules::{Rule, RuleContext};

pub const ASSET_DIR: &str = "/usr/share/ddct/assets";

const ISCSID_CONF: &str = "/etc/iscsi/iscsid.conf";
const UDEV_RULES: &str = "/etc/udev/rules.d/99-iscsi-luns.rules";
const SERIAL_HELPER: &str = "/sbin/fetch_device_serial_no.sh";
const GC_INTERVAL: &str = "/proc/sys/net/ipv4/route/gc_interval";
const GRUB_DEFAULT: &str = "/etc/default/grub";

const NOOP_TIMEOUT: &str = "node.session.timeo.noop_out_timeout";
const NOOP_INTERVAL: &str = "node.session.timeo.noop_out_interval";

pub const SYSCTL_SETTINGS: &[(&str, &str, &str)] = &[
    ("net.core.netdev_max_backlog", "250000", "7656C46C"),
    ("net.core.optmem_max", "8388608", "8FA26A66"),
    ("net.core.rmem_default", "8388608", "FBCA17D5"),
    ("net.core.rmem_max", "16777216", "4C4B3F0B"),
    ("net.core.somaxconn", "1024", "34A7B822"),
    ("net.core.wmem_default", "8388608", "68191DE5"),
    ("net.core.wmem_max", "16777216", "7F8479C2"),
    ("net.ipv4.tcp_adv_win_scale", "1", "1F523B04"),
    ("net.ipv4.tcp_fin_timeout", "15", "59FD5DF7"),
    ("net.ipv4.tcp_low_latency", "1", "6BE2899E"),
    ("net.ipv4.tcp_max_syn_backlog", "8192", "2862CB28"),
    ("net.ipv4.tcp_rmem", "4096 87380 16777216", "2A6057BD"),
    ("net.ipv4.tcp_sack", "1", "7A9AB850"),
    ("net.ipv4.tcp_synack_retries", "2", "55EF997B"),
    ("net.ipv4.tcp_syncookies", "1", "01C594E7"),
    ("net.ipv4.tcp_timestamps", "0", "F0D7A1AD"),
    ("net.ipv4.tcp_tw_reuse", "1", "989229FC"),
    ("net.ipv4.tcp_window_scaling", "1", "A8A6F381"),
    ("net.ipv4.tcp_wmem", "4096 65536 16777216", "CD37F436"),
];

pub fn load_checks() -> Vec<Rule> {
    vec![
        Rule::new("OS", &["basic", "os", "local"], check_os),
        Rule::new("ISCSI", &["basic", "iscsi", "local"], check_iscsi),
        Rule::new(
            "SYSCTL",
            &["basic", "sysctl", "misc", "local"],
            check_sysctl,
        ),
        Rule::new("UDEV", &["basic", "udev", "local"], check_udev),
        Rule::new("ARP", &["basic", "arp", "local"], check_arp),
        Rule::new("IRQ", &["basic", "irq", "local"], check_irq),
        Rule::new("CPUFREQ", &["basic", "cpufreq", "local"], check_cpufreq),
        Rule::new(
            "Block Devices",
            &["basic", "block_device", "local"],
            check_block_devices,
        ),
    ]
}

fn check_os(ctx: &RuleContext<'_>) -> Result<()> {
    if platform::os_family().is_none() {
        ctx.fail(
            format!(
                "Unsupported Operating System. Supported operating systems: [{}, {}]",
                OsFamily::Ubuntu.as_str(),
                OsFamily::Centos.as_str()
            ),
            "3C47368",
        );
    }
    Ok(())
}

fn check_sysctl(ctx: &RuleContext<'_>) -> Result<()> {
    for (key, expected, code) in SYSCTL_SETTINGS {
        let found = platform::shell_output(&format!("sysctl --values {key}")).unwrap_or_default();
        if !sysctl_value_matches(&found, expected) {
            ctx.fail(
                format!(
                    "{key}={expected} is not set. Found: {}",
                    normalize_sysctl_value(&found)
                ),
                code,
            );
        }
    }
    Ok(())
}

fn normalize_sysctl_value(raw: &str) -> String {
    raw.trim()
        .trim_matches('"')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn sysctl_value_matches(found: &str, expected: &str) -> bool {
    normalize_sysctl_value(found) == normalize_sysctl_value(expected)
}

fn check_iscsi(ctx: &RuleContext<'_>) -> Result<()> {
    if !platform::binary_available("iscsiadm") {
        let fix = match platform::os_family() {
            Some(OsFamily::Centos) => "yum install iscsi-initiator-utils",
            _ => "apt-get install open-iscsi",
        };
        ctx.fail_with_fix(
            "iscsiadm is not available, has open-iscsi been installed?",
            "EFBB085C",
            fix,
        );
    }
    if !platform::shell_succeeds("ps -ef | grep iscsid | grep -v grep") {
        ctx.fail_with_fix(
            "iscsid is not running.  Is the iscsid service running?",
            "EB22737E",
            "service iscsi start || systemctl start iscsid.service",
        );
    }

    let path = Path::new(ISCSID_CONF);
    if !path.exists() {
        ctx.fail("iscsid configuration file does not exist", "C6F2B356");
        return Ok(());
    }
    let text = std::fs::read_to_string(path)?;
    for finding in inspect_iscsid_conf(&text) {
        ctx.record(finding);
    }
    Ok(())
}

/// Checks the noop timers in an iscsid.conf body. Commented lines are ignored.
pub fn inspect_iscsid_conf(text: &str) -> Vec<Finding> {
    let mut out = Vec::new();
    let mut timeout_seen = false;
    let mut interval_seen = false;

    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        let line_no = idx + 1;

        let (seen, bad_code, dup_code) = match key {
            NOOP_TIMEOUT => (&mut timeout_seen, "F6A49337", "D3E55910"),
            NOOP_INTERVAL => (&mut interval_seen, "E48C1907", "CA9AA865"),
            _ => continue,
        };
        if *seen {
            out.push(Finding::warning(
                format!("{key} duplicate found in iscsid.conf, line {line_no}"),
                dup_code,
            ));
            continue;
        }
        *seen = true;
        if value != "2" {
            out.push(Finding::failure(
                format!("{key} is not set to '2' in iscsid.conf"),
                bad_code,
            ));
        }
    }

    if !timeout_seen {
        out.push(Finding::failure(
            format!("'{NOOP_TIMEOUT} = 2' is not present in iscsid.conf"),
            "E29BF18A",
        ));
    }
    if !interval_seen {
        out.push(Finding::failure(
            format!("'{NOOP_INTERVAL} = 2' is not present in iscsid.conf"),
            "A2EED511",
        ));
    }
    out
}

fn check_udev(ctx: &RuleContext<'_>) -> Result<()> {
    if !Path::new(UDEV_RULES).exists() {
        ctx.fail_with_fix(
            "udev rules for iSCSI LUNs are not installed",
            "1C8F2E07",
            format!("A copy of the udev rules is available at: {ASSET_DIR}/99-iscsi-luns.rules"),
        );
    }
    if !Path::new(SERIAL_HELPER).exists() {
        ctx.fail_with_fix(
            "fetch_device_serial_no.sh is missing from /sbin",
            "6D03F50B",
            format!(
                "A copy of fetch_device_serial_no.sh is available at: {ASSET_DIR}/fetch_device_serial_no.sh"
            ),
        );
    }
    Ok(())
}

fn check_arp(ctx: &RuleContext<'_>) -> Result<()> {
    if !platform::shell_succeeds(
        "sysctl --all 2>/dev/null | grep 'net.ipv4.conf.all.arp_announce = 2'",
    ) {
        ctx.fail_with_fix(
            "net.ipv4.conf.all.arp_announce != 2 in sysctl",
            "9000C3B6",
            "sysctl net.ipv4.conf.all.arp_announce=2",
        );
    }
    if !platform::shell_succeeds("sysctl --all 2>/dev/null | grep 'net.ipv4.conf.all.arp_ignore = 1'")
    {
        ctx.fail_with_fix(
            "net.ipv4.conf.all.arp_ignore != 1 in sysctl",
            "BDB4D5D8",
            "sysctl net.ipv4.conf.all.arp_ignore=1",
        );
    }

    let gc = std::fs::read_to_string(GC_INTERVAL)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok());
    if gc != Some(5) {
        let shown = gc.map_or_else(|| "unreadable".to_string(), |v| v.to_string());
        ctx.fail_with_fix(
            format!("{GC_INTERVAL} is currently set to {shown}"),
            "A06CD19F",
            format!("echo 5 > {GC_INTERVAL}"),
        );
    }
    Ok(())
}

fn check_irq(ctx: &RuleContext<'_>) -> Result<()> {
    let (probe, fix) = if platform::binary_available("systemctl") {
        (
            "systemctl status irqbalance | grep 'Active: active'",
            "systemctl stop irqbalance && systemctl disable irqbalance",
        )
    } else {
        (
            "service irqbalance status | grep 'Active: active'",
            "service irqbalance stop",
        )
    };
    if platform::shell_succeeds(probe) {
        ctx.fail_with_fix("irqbalance is active", "B19D9FF1", fix);
    }
    Ok(())
}

fn check_cpufreq(ctx: &RuleContext<'_>) -> Result<()> {
    if !platform::binary_available("cpupower") {
        let fix = match platform::os_family() {
            Some(OsFamily::Ubuntu) => {
                let kernel = platform::shell_output("uname -r").unwrap_or_default();
                format!("apt-get install linux-tools-{}", kernel.trim())
            }
            _ => "yum install kernel-tools".to_string(),
        };
        ctx.fail_with_fix("cpupower is not installed", "20CEE732", fix);
        return Ok(());
    }
    if !platform::shell_succeeds("cpupower frequency-info --governors | grep performance") {
        ctx.fail_with_fix(
            "No 'performance' governor found for system",
            "333FBD45",
            "No-fix -- if this system is a VM governors might not be available and this check can be ignored",
        );
    }
    Ok(())
}

fn check_block_devices(ctx: &RuleContext<'_>) -> Result<()> {
    let path = Path::new(GRUB_DEFAULT);
    if !path.exists() {
        ctx.fail(
            format!("Could not find default grub file at {GRUB_DEFAULT}"),
            "6F7B6A25",
        );
        return Ok(());
    }
    let text = std::fs::read_to_string(path)?;
    if let Some(finding) = inspect_grub_default(&text) {
        ctx.record(finding);
    }
    Ok(())
}

pub fn inspect_grub_default(text: &str) -> Option<Finding> {
    let cmdlines: Vec<&str> = text
        .lines()
        .filter(|l| {
            l.starts_with("GRUB_CMDLINE_LINUX_DEFAULT=") || l.starts_with("GRUB_CMDLINE_LINUX=")
        })
        .collect();
    if cmdlines.is_empty() {
        return Some(Finding::failure(
            "GRUB_CMDLINE_LINUX_DEFAULT and GRUB_CMDLINE_LINUX are missing from GRUB file",
            "A65B6D97",
        ));
    }
    if cmdlines.iter().any(|l| l.contains("elevator=noop")) {
        return None;
    }
    Some(
        Finding::failure("Scheduler is not set to noop", "47BB5083").with_fix(
            "Add 'elevator=noop' to /etc/default/grub in the 'GRUB_CMDLINE_LINUX_DEFAULT' line",
        ),
    )
}
