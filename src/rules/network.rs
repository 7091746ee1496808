use std::net::{IpAddr, ToSocketAddrs};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Result, anyhow};
use regex::Regex;

use crate::platform;
use crate::rules::{Rule, RuleContext};

const NET_FIX: &str = "Check the network connection.  If this failure is intermittent check for \
duplicate ips.  This can also be due to MTU fragmentation";

pub const NEIGHBOR_RETRIES: u32 = 5;
pub const NEIGHBOR_INTERVAL: Duration = Duration::from_secs(1);

static ROUTE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<net>[\w.:/]+).*\bdev\s(?P<iface>[\w.:@-]+)").expect("valid regex literal")
});
static MTU_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bmtu (\d+)\b").expect("valid regex literal"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Mgmt,
    Vip1,
    Vip2,
}

impl Endpoint {
    fn key(self) -> &'static str {
        match self {
            Endpoint::Mgmt => "mgmt_ip",
            Endpoint::Vip1 => "vip1_ip",
            Endpoint::Vip2 => "vip2_ip",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Endpoint::Mgmt => "mgmt",
            Endpoint::Vip1 => "vip1",
            Endpoint::Vip2 => "vip2",
        }
    }

    fn cluster_iface(self) -> &'static str {
        match self {
            Endpoint::Mgmt => "mgt1",
            Endpoint::Vip1 => "netA1",
            Endpoint::Vip2 => "netA2",
        }
    }

    fn cluster_mtu_key(self) -> &'static str {
        match self {
            Endpoint::Mgmt => "mgmt_mtu",
            Endpoint::Vip1 | Endpoint::Vip2 => "access_mtu",
        }
    }

    fn codes(self) -> (&'static str, &'static str) {
        match self {
            Endpoint::Mgmt => ("65FC68BB", "BF6A912A"),
            Endpoint::Vip1 => ("1827147B", "3C33D70D"),
            Endpoint::Vip2 => ("3D76CE5A", "4F6B8D91"),
        }
    }
}

pub fn load_checks() -> Vec<Rule> {
    const CONN: &[&str] = &["basic", "connection", "local"];
    const MTU: &[&str] = &["connection", "local"];
    vec![
        Rule::new("MGMT", CONN, |ctx| check_reachable(ctx, Endpoint::Mgmt)),
        Rule::new("VIP1", CONN, |ctx| check_reachable(ctx, Endpoint::Vip1)),
        Rule::new("VIP2", CONN, |ctx| check_reachable(ctx, Endpoint::Vip2)),
        Rule::new("CALLHOME", &["basic", "setup", "local"], check_callhome),
        Rule::new("MGMT MTU", MTU, |ctx| check_mtu(ctx, Endpoint::Mgmt)),
        Rule::new("VIP1 MTU", MTU, |ctx| check_mtu(ctx, Endpoint::Vip1)),
        Rule::new("VIP2 MTU", MTU, |ctx| check_mtu(ctx, Endpoint::Vip2)),
    ]
}

fn required_address<'a>(ctx: &RuleContext<'a>, endpoint: Endpoint) -> Result<&'a str> {
    ctx.config()
        .get_str(endpoint.key())
        .ok_or_else(|| anyhow!("{} is missing from the host configuration", endpoint.key()))
}

fn check_reachable(ctx: &RuleContext<'_>, endpoint: Endpoint) -> Result<()> {
    let ip = if endpoint == Endpoint::Vip2 {
        match ctx.config().vip2_ip() {
            Some(ip) => ip,
            None => {
                ctx.warn("No vip2_ip found", "16EB208B");
                return Ok(());
            }
        }
    } else {
        required_address(ctx, endpoint)?
    };
    let (ping_code, neigh_code) = endpoint.codes();

    if !platform::shell_succeeds(&format!("ping -c 2 -W 1 {ip}")) {
        ctx.fail_with_fix(
            format!("Could not ping {} ip {ip}", endpoint.label()),
            ping_code,
            NET_FIX,
        );
    }

    let probe = format!("ip neigh show | grep {ip} | grep REACHABLE");
    let reachable = poll_until(NEIGHBOR_RETRIES, NEIGHBOR_INTERVAL, || {
        platform::shell_succeeds(&probe)
    });
    if !reachable {
        ctx.fail_with_fix(
            format!("Arp state for {} [{ip}] is not 'REACHABLE'", endpoint.label()),
            neigh_code,
            format!("Check the connection to {ip}"),
        );
    }
    Ok(())
}

pub fn poll_until(retries: u32, interval: Duration, mut probe: impl FnMut() -> bool) -> bool {
    if probe() {
        return true;
    }
    for attempt in 1..=retries {
        std::thread::sleep(interval);
        if probe() {
            tracing::debug!(attempt, "probe satisfied after retry");
            return true;
        }
    }
    false
}

fn check_callhome(ctx: &RuleContext<'_>) -> Result<()> {
    let api = ctx
        .config()
        .api()
        .ok_or_else(|| anyhow!("no storage API is configured (missing `cluster` section)"))?;
    let system = api.system()?;
    if !system
        .get("callhome_enabled")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
    {
        ctx.warn("Callhome is not enabled", "675E2887");
    }
    Ok(())
}

fn check_mtu(ctx: &RuleContext<'_>, endpoint: Endpoint) -> Result<()> {
    // VIP2 is optional; its absence is already reported by the VIP2 check.
    let ip = if endpoint == Endpoint::Vip2 {
        match ctx.config().vip2_ip() {
            Some(ip) => ip,
            None => return Ok(()),
        }
    } else {
        required_address(ctx, endpoint)?
    };
    let api = ctx
        .config()
        .api()
        .ok_or_else(|| anyhow!("no storage API is configured (missing `cluster` section)"))?;
    let system = api.system()?;

    let routes = platform::shell_output("ip route show")
        .map(|out| parse_route_table(&out))
        .unwrap_or_default();
    let Some(iface) = resolve_address(ip).and_then(|addr| interface_for(&routes, addr)) else {
        ctx.fail(
            format!("Couldn't find interface with network matching ip {ip}"),
            "710BFC7E",
        );
        return Ok(());
    };

    let l3 = system
        .get("l3_enabled")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);
    if l3 {
        // Routed fabrics fragment anyway; only delivery matters.
        if !platform::shell_succeeds(&format!("ping -s 32000 -c 2 -W 1 {ip}")) {
            if !platform::shell_succeeds(&format!("ping -c 2 -W 1 {ip}")) {
                ctx.fail(format!("Could not ping interface [{ip}]"), "EC2D3621");
                return Ok(());
            }
            ctx.fail(
                format!(
                    "Could not ping interface [{ip}] with large (32k) packet size, packet \
fragmentation may not be working correctly."
                ),
                "A4CA0D72",
            );
        }
        return Ok(());
    }

    let local_mtu = platform::shell_output(&format!("ip ad show {iface} | grep mtu"))
        .ok()
        .and_then(|out| parse_link_mtu(&out));
    let Some(local_mtu) = local_mtu else {
        ctx.fail(
            format!("Couldn't find client {} interface MTU", endpoint.label()),
            "CBF8CC4C",
        );
        return Ok(());
    };

    let cluster_mtu = system
        .get(endpoint.cluster_mtu_key())
        .and_then(serde_json::Value::as_u64);
    let Some(cluster_mtu) = cluster_mtu else {
        ctx.fail(
            format!(
                "Couldn't find cluster {} interface MTU",
                endpoint.cluster_iface()
            ),
            "057AF23D",
        );
        return Ok(());
    };

    if u64::from(local_mtu) != cluster_mtu {
        ctx.fail(
            format!(
                "Local interface {iface} MTU does not match cluster {} interface MTU [{local_mtu} != {cluster_mtu}]",
                endpoint.cluster_iface()
            ),
            "D7F667BC",
        );
    }
    if !platform::shell_succeeds(&format!("ping -s 32000 -c 2 -W 1 {ip}")) {
        ctx.fail(
            "Could not ping interface with large (32k) packet size, packet fragmentation may not \
be working correctly",
            "A4CA0D72",
        );
    }
    Ok(())
}

fn resolve_address(host: &str) -> Option<IpAddr> {
    if let Ok(addr) = host.parse::<IpAddr>() {
        return Some(addr);
    }
    (host, 0)
        .to_socket_addrs()
        .ok()?
        .map(|sa| sa.ip())
        .next()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub network: IpAddr,
    pub prefix: u8,
    pub iface: String,
}

impl Route {
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.network, addr) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = prefix_mask_u32(self.prefix);
                (u32::from(net) & mask) == (u32::from(ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = prefix_mask_u128(self.prefix);
                (u128::from(net) & mask) == (u128::from(ip) & mask)
            }
            _ => false,
        }
    }
}

fn prefix_mask_u32(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        p if p >= 32 => u32::MAX,
        p => u32::MAX << (32 - u32::from(p)),
    }
}

fn prefix_mask_u128(prefix: u8) -> u128 {
    match prefix {
        0 => 0,
        p if p >= 128 => u128::MAX,
        p => u128::MAX << (128 - u32::from(p)),
    }
}

pub fn parse_route_table(text: &str) -> Vec<Route> {
    let mut out = Vec::new();
    for line in text.lines() {
        let Some(caps) = ROUTE_RE.captures(line.trim()) else {
            continue;
        };
        let net = &caps["net"];
        let (addr, prefix) = match net.split_once('/') {
            Some((addr, prefix)) => (addr, prefix.parse::<u8>().ok()),
            None => (net, None),
        };
        let Ok(network) = addr.parse::<IpAddr>() else {
            continue;
        };
        let prefix = prefix.unwrap_or(if network.is_ipv4() { 32 } else { 128 });
        out.push(Route {
            network,
            prefix,
            iface: caps["iface"].to_string(),
        });
    }
    out
}

/// Most specific route wins.
pub fn interface_for(routes: &[Route], addr: IpAddr) -> Option<String> {
    routes
        .iter()
        .filter(|r| r.contains(addr))
        .max_by_key(|r| r.prefix)
        .map(|r| r.iface.clone())
}

pub fn parse_link_mtu(text: &str) -> Option<u32> {
    MTU_RE
        .captures(text)
        .and_then(|caps| caps[1].parse::<u32>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    const ROUTES: &str = "\
default via 192.168.1.1 dev eth0 proto dhcp metric 100
10.0.0.0/16 dev ens4 proto kernel scope link src 10.0.3.7
10.0.1.0/24 dev ens5 proto kernel scope link src 10.0.1.9
172.17.0.0/16 dev docker0 proto kernel scope link src 172.17.0.1 linkdown
192.168.1.0/24 dev eth0 proto kernel scope link src 192.168.1.20
";

    #[test]
    fn route_table_skips_default_and_picks_longest_prefix() {
        let routes = parse_route_table(ROUTES);
        assert_eq!(routes.len(), 4);
        let ip: IpAddr = "10.0.1.1".parse().expect("ip");
        assert_eq!(interface_for(&routes, ip).as_deref(), Some("ens5"));
        let ip: IpAddr = "10.0.2.1".parse().expect("ip");
        assert_eq!(interface_for(&routes, ip).as_deref(), Some("ens4"));
        let ip: IpAddr = "8.8.8.8".parse().expect("ip");
        assert_eq!(interface_for(&routes, ip), None);
    }

    #[test]
    fn host_routes_and_ipv6_are_understood() {
        let routes = parse_route_table("10.9.9.9 dev tun0 scope link\nfd00::/64 dev ens6 proto kernel\n");
        assert_eq!(routes[0].prefix, 32);
        let v6: IpAddr = "fd00::42".parse().expect("ip");
        assert_eq!(interface_for(&routes, v6).as_deref(), Some("ens6"));
    }

    #[test]
    fn link_mtu_is_parsed_from_ip_addr_output() {
        let line = "3: ens5: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 9000 qdisc mq state UP group default qlen 1000";
        assert_eq!(parse_link_mtu(line), Some(9000));
        assert_eq!(parse_link_mtu("no mtu here"), None);
    }

    #[test]
    fn poll_until_is_bounded() {
        let calls = Cell::new(0);
        let ok = poll_until(5, Duration::ZERO, || {
            calls.set(calls.get() + 1);
            false
        });
        assert!(!ok);
        assert_eq!(calls.get(), 6);

        let calls = Cell::new(0);
        let ok = poll_until(5, Duration::ZERO, || {
            calls.set(calls.get() + 1);
            calls.get() == 3
        });
        assert!(ok);
        assert_eq!(calls.get(), 3);
    }
}
