use std::path::Path;

use anyhow::{Context, Result, anyhow};
use time::OffsetDateTime;

use crate::fixes::{FixAction, FixRegistry};
use crate::platform::{self, OsFamily};
use crate::rules::multipath::MULTIPATH_CONF;

const GRUB_DEFAULT: &str = "/etc/default/grub";
const GC_INTERVAL: &str = "/proc/sys/net/ipv4/route/gc_interval";

const MULTIPATH_TEMPLATE: &str = r#"defaults {
    checker_@TIMER@ 5
}

devices {
    device {
        vendor "DATERA"
        product "IBLOCK"
        getuid_callout "/lib/udev/scsi_id --whitelisted --replace-whitespace --page=0x80 --device=/dev/%n"
        path_grouping_policy group_by_prio
        path_checker tur
        prio alua
        path_selector "queue-length 0"
        hardware_handler "1 alua"
        failback 5
    }
}

blacklist {
    device {
        vendor ".*"
        product ".*"
    }
}

blacklist_exceptions {
    device {
        vendor "DATERA.*"
        product "IBLOCK.*"
    }
}
"#;

pub fn registry() -> FixRegistry {
    let mut r = FixRegistry::new();
    r.insert("9000C3B6", vec![arp_announce()]);
    r.insert("BDB4D5D8", vec![arp_ignore()]);
    r.insert("A06CD19F", vec![route_gc_interval()]);
    r.insert("B19D9FF1", vec![irqbalance_stop()]);
    r.insert("20CEE732", vec![cpufreq_tools(), cpufreq_governor()]);
    r.insert(
        "A65B6D97",
        vec![FixAction::no_fix(
            "No automatic fix: add a GRUB_CMDLINE_LINUX_DEFAULT line by hand",
        )],
    );
    r.insert("47BB5083", vec![grub_noop_elevator()]);
    r.insert("2D18685C", vec![multipath_install(), multipath_enable()]);
    r.insert("541C10BF", vec![multipath_enable()]);
    r.insert("1D506D89", vec![multipath_conf()]);
    r
}

fn sh(script: &str) -> Result<()> {
    platform::shell_output(script).map(|_| ())
}

fn require_os() -> Result<OsFamily> {
    platform::os_family().ok_or_else(|| anyhow!("unsupported distribution: neither apt-get nor yum found"))
}

fn arp_announce() -> FixAction {
    FixAction::plain("arp-announce", "Fixes net.ipv4.conf.all.arp_announce", || {
        sh("sysctl -w net.ipv4.conf.all.arp_announce=2")
    })
}

fn arp_ignore() -> FixAction {
    FixAction::plain("arp-ignore", "Fixes net.ipv4.conf.all.arp_ignore", || {
        sh("sysctl -w net.ipv4.conf.all.arp_ignore=1")
    })
}

fn route_gc_interval() -> FixAction {
    FixAction::plain("route-gc-interval", "Sets the route cache gc interval to 5", || {
        std::fs::write(GC_INTERVAL, "5\n").with_context(|| format!("failed to write {GC_INTERVAL}"))
    })
}

fn irqbalance_stop() -> FixAction {
    FixAction::plain("irqbalance-stop", "Stops irqbalance services", || {
        if platform::binary_available("systemctl") {
            sh("systemctl stop irqbalance && systemctl disable irqbalance")
        } else {
            sh("service irqbalance stop")
        }
    })
}

fn cpufreq_tools() -> FixAction {
    FixAction::plain("cpufreq-tools", "Installs cpufreq tooling packages", || {
        match require_os()? {
            OsFamily::Ubuntu => {
                sh("apt-get install linux-tools-$(uname -r) linux-cloud-tools-$(uname -r) linux-tools-common -y")?;
                sh("apt-get install cpufrequtils -y")
            }
            OsFamily::Centos => sh("yum install kernel-tools -y"),
        }
    })
}

fn cpufreq_governor() -> FixAction {
    FixAction::plain("cpufreq-governor", "Updates governor to performance via cpufreq", || {
        sh("cpupower frequency-set --governor performance")?;
        match require_os()? {
            OsFamily::Ubuntu => sh("service cpufrequtils restart")?,
            OsFamily::Centos => {
                sh("service cpupower restart")?;
                sh("systemctl daemon-reload")?;
            }
        }
        sh("rm -f /etc/rc?.d/*ondemand")
    })
}

fn grub_noop_elevator() -> FixAction {
    FixAction::plain(
        "grub-noop-elevator",
        "Updates GRUB with noop scheduling, requires restart",
        || {
            let path = Path::new(GRUB_DEFAULT);
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {GRUB_DEFAULT}"))?;
            let backup = backup_path(GRUB_DEFAULT);
            std::fs::copy(path, &backup)
                .with_context(|| format!("failed to back up {GRUB_DEFAULT} to {backup}"))?;
            tracing::info!(%backup, "grub defaults backed up");
            platform::write_atomic(path, add_noop_elevator(&text).as_bytes())?;
            match require_os()? {
                OsFamily::Ubuntu => sh("update-grub2"),
                OsFamily::Centos => sh("grub2-mkconfig -o /boot/grub2/grub.cfg"),
            }
        },
    )
}

fn multipath_install() -> FixAction {
    FixAction::plain("multipath-install", "Installs multipath tooling packages", || {
        match require_os()? {
            OsFamily::Ubuntu => sh("apt-get install multipath-tools -y"),
            OsFamily::Centos => sh("yum install device-mapper-multipath -y"),
        }
    })
}

fn multipath_enable() -> FixAction {
    FixAction::plain("multipath-enable", "Enables multipathd service", || {
        let unit = match require_os()? {
            OsFamily::Ubuntu => "multipath-tools",
            OsFamily::Centos => "multipathd",
        };
        sh(&format!("systemctl start {unit}"))?;
        sh(&format!("systemctl enable {unit}"))
    })
}

fn multipath_conf() -> FixAction {
    FixAction::plain(
        "multipath-conf",
        "Writes completely new multipath.conf based off of template",
        || {
            let os = require_os()?;
            let path = Path::new(MULTIPATH_CONF);
            if path.exists() {
                let backup = backup_path(MULTIPATH_CONF);
                std::fs::copy(path, &backup)
                    .with_context(|| format!("failed to back up {MULTIPATH_CONF} to {backup}"))?;
                tracing::info!(%backup, "existing multipath.conf moved aside");
            }
            platform::write_atomic(path, multipath_conf_template(os).as_bytes())
        },
    )
}

fn backup_path(original: &str) -> String {
    let suffix = OffsetDateTime::now_utc().unix_timestamp_nanos() as u64 & 0xffff;
    format!("{original}.bak.{suffix:04x}")
}

pub fn multipath_conf_template(os: OsFamily) -> String {
    match os {
        OsFamily::Ubuntu => MULTIPATH_TEMPLATE.replace("@TIMER@", "timer"),
        // getuid_callout is deprecated on RHEL derivatives
        OsFamily::Centos => MULTIPATH_TEMPLATE
            .replace("@TIMER@", "timeout")
            .lines()
            .filter(|l| !l.contains("getuid"))
            .map(|l| format!("{l}\n"))
            .collect(),
    }
}

pub fn add_noop_elevator(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    for line in text.split_inclusive('\n') {
        if line.contains("GRUB_CMDLINE_LINUX_DEFAULT=") && !line.contains("elevator=noop") {
            if let Some(close) = line.rfind('"') {
                let (head, tail) = line.split_at(close);
                out.push_str(head);
                if !head.ends_with('"') {
                    out.push(' ');
                }
                out.push_str("elevator=noop");
                out.push_str(tail);
                continue;
            }
        }
        out.push_str(line);
    }
    out
}
