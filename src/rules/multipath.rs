use std::path::Path;

use anyhow::Result;

use crate::core::Finding;
use crate::platform;
use crate::rules::{Rule, RuleContext, local::ASSET_DIR};

pub const MULTIPATH_CONF: &str = "/etc/multipath.conf";

const CONF_FIX: &str = "check the example multipath.conf file from the deployment guide";

pub fn load_checks() -> Vec<Rule> {
    vec![
        Rule::new("Multipath", &["basic", "multipath", "local"], check_multipath),
        Rule::new(
            "Multipath Conf",
            &["basic", "multipath", "local"],
            check_multipath_conf,
        ),
    ]
}

fn check_multipath(ctx: &RuleContext<'_>) -> Result<()> {
    if !platform::binary_available("multipath") {
        ctx.fail(
            "Multipath binary could not be found, is it installed?",
            "2D18685C",
        );
    }
    let (probe, fix) = if platform::binary_available("systemctl") {
        (
            "systemctl status multipathd | grep 'Active: active'",
            "systemctl start multipathd",
        )
    } else {
        (
            "service multipathd status | grep 'Active: active'",
            "service multipathd start",
        )
    };
    if !platform::shell_succeeds(probe) {
        ctx.fail_with_fix("multipathd not enabled", "541C10BF", fix);
    }
    Ok(())
}

fn check_multipath_conf(ctx: &RuleContext<'_>) -> Result<()> {
    if platform::os_family().is_none() {
        ctx.warn(
            "No supported multipath.conf file for: unknown distribution",
            "381CE248",
        );
    }
    let path = Path::new(MULTIPATH_CONF);
    if !path.exists() {
        ctx.fail_with_fix(
            format!("{MULTIPATH_CONF} file not found"),
            "1D506D89",
            format!(
                "copy multipath.conf file from the deployment guide or the {ASSET_DIR} folder on your system"
            ),
        );
        return Ok(());
    }
    let text = std::fs::read_to_string(path)?;
    for finding in inspect_mconf(&parse_mconf(&text)) {
        ctx.record(finding);
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MconfNode {
    Value { key: String, value: String },
    Section { name: String, body: Vec<MconfNode> },
}

impl MconfNode {
    fn section<'a>(nodes: &'a [MconfNode], wanted: &str) -> Option<&'a [MconfNode]> {
        nodes.iter().find_map(|n| match n {
            MconfNode::Section { name, body } if name == wanted => Some(body.as_slice()),
            _ => None,
        })
    }

    fn value<'a>(nodes: &'a [MconfNode], wanted: &str) -> Option<&'a str> {
        nodes.iter().find_map(|n| match n {
            MconfNode::Value { key, value } if key == wanted => Some(value.as_str()),
            _ => None,
        })
    }

    fn devices(nodes: &[MconfNode]) -> impl Iterator<Item = &[MconfNode]> {
        nodes.iter().filter_map(|n| match n {
            MconfNode::Section { name, body } if name == "device" => Some(body.as_slice()),
            _ => None,
        })
    }
}

pub fn parse_mconf(text: &str) -> Vec<MconfNode> {
    fn block<'a>(lines: &mut impl Iterator<Item = &'a str>) -> Vec<MconfNode> {
        let mut out = Vec::new();
        while let Some(line) = lines.next() {
            let words: Vec<&str> = line.split_whitespace().collect();
            let Some(first) = words.first() else {
                continue;
            };
            if first.starts_with('#') {
                continue;
            }
            match words.last() {
                Some(&"{") => out.push(MconfNode::Section {
                    name: (*first).to_string(),
                    body: block(lines),
                }),
                Some(&"}") => break,
                _ => out.push(MconfNode::Value {
                    key: (*first).to_string(),
                    value: words[1..]
                        .join(" ")
                        .trim_matches(|c| c == '"' || c == '\'')
                        .to_string(),
                }),
            }
        }
        out
    }

    block(&mut text.lines())
}

pub fn inspect_mconf(conf: &[MconfNode]) -> Vec<Finding> {
    let fail = |msg: &str, code: &str| Finding::failure(msg, code).with_fix(CONF_FIX);
    let mut out = Vec::new();

    match MconfNode::section(conf, "defaults") {
        None => out.push(fail("Missing defaults section", "1D8C438C")),
        Some(defaults) => {
            let has_timer = MconfNode::value(defaults, "checker_timeout").is_some()
                || MconfNode::value(defaults, "checker_timer").is_some();
            if !has_timer {
                out.push(fail(
                    "defaults section missing 'checker_timeout'",
                    "70191A9A",
                ));
            }
        }
    }

    match MconfNode::section(conf, "devices") {
        None => out.push(fail("Missing devices section", "797A6031")),
        Some(devices) => {
            let device = MconfNode::devices(devices)
                .find(|d| MconfNode::value(d, "vendor") == Some("DATERA"));
            let Some(device) = device else {
                out.push(fail("No DATERA device section found", "99B9D136"));
                return out;
            };
            if MconfNode::value(device, "product") != Some("IBLOCK") {
                out.push(fail(
                    "DATERA 'product' entry should be \"IBLOCK\"",
                    "A9DF3F8C",
                ));
            }
        }
    }

    match MconfNode::section(conf, "blacklist_exceptions") {
        None => out.push(Finding::failure(
            "Missing blacklist_exceptions section",
            "B8C8A19C",
        )),
        Some(exceptions) => {
            let device = MconfNode::devices(exceptions).find(|d| {
                MconfNode::value(d, "vendor").is_some_and(|v| v.starts_with("DATERA"))
            });
            let Some(device) = device else {
                out.push(fail(
                    "No DATERA blacklist_exceptions section found",
                    "09E37E51",
                ));
                return out;
            };
            if MconfNode::value(device, "vendor") != Some("DATERA.*") {
                out.push(fail(
                    "DATERA blacklist_exceptions vendor entry malformed",
                    "9990F32F",
                ));
            }
            if MconfNode::value(device, "product") != Some("IBLOCK.*") {
                out.push(fail(
                    "DATERA blacklist_exceptions product entry malformed",
                    "642753A0",
                ));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixes::builtin::multipath_conf_template;
    use crate::platform::OsFamily;

    fn codes(findings: Vec<Finding>) -> Vec<String> {
        findings
            .into_iter()
            .filter_map(Finding::into_issue)
            .map(|i| i.code.to_string())
            .collect()
    }

    #[test]
    fn parse_mconf_builds_nested_sections() {
        let text = r#"
# comment
defaults {
    checker_timeout 5
}
devices {
    device {
        vendor "DATERA"
        path_selector "queue-length 0"
    }
}
"#;
        let conf = parse_mconf(text);
        assert_eq!(conf.len(), 2);
        let devices = MconfNode::section(&conf, "devices").expect("devices");
        let device = MconfNode::devices(devices).next().expect("device");
        assert_eq!(MconfNode::value(device, "vendor"), Some("DATERA"));
        assert_eq!(
            MconfNode::value(device, "path_selector"),
            Some("queue-length 0")
        );
    }

    #[test]
    fn shipped_templates_pass_inspection() {
        for os in [OsFamily::Ubuntu, OsFamily::Centos] {
            let conf = parse_mconf(&multipath_conf_template(os));
            assert!(inspect_mconf(&conf).is_empty(), "{os:?}");
        }
    }

    #[test]
    fn empty_conf_reports_missing_sections() {
        assert_eq!(
            codes(inspect_mconf(&[])),
            vec!["1D8C438C", "797A6031", "B8C8A19C"]
        );
    }

    #[test]
    fn wrong_product_and_exception_entries_are_flagged() {
        let text = r#"
defaults {
    checker_timeout 5
}
devices {
    device {
        vendor "DATERA"
        product "OTHER"
    }
}
blacklist_exceptions {
    device {
        vendor "DATERA"
        product "IBLOCK"
    }
}
"#;
        assert_eq!(
            codes(inspect_mconf(&parse_mconf(text))),
            vec!["A9DF3F8C", "9990F32F", "642753A0"]
        );
    }
}
