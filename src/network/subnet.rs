//! Private subnet allocation for the host bridge
//!
//! Provides:
//! - Discovery of the subnet already routed through a bridge
//! - A persisted allocation under the network data directory
//! - Random `10.A.B` candidates probed against the routing table and ping

use crate::error::SubnetError;
use crate::process::{ProcessRunner, ProcessSpec};
use ipnet::Ipv4Net;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// File under the network directory holding the allocated prefix
pub const SUBNET_FILE: &str = "multipass_subnet";

const MAX_ATTEMPTS: usize = 100;

/// First three octets of a /24 network, e.g. "10.12.3"
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subnet(String);

impl Subnet {
    pub fn from_octets(a: u8, b: u8, c: u8) -> Self {
        Self(format!("{}.{}.{}", a, b, c))
    }

    /// Wrap a prefix read back from disk; not validated
    pub fn from_persisted(prefix: &str) -> Self {
        Self(prefix.trim().to_string())
    }

    fn from_addr(addr: Ipv4Addr) -> Self {
        let [a, b, c, _] = addr.octets();
        Self::from_octets(a, b, c)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `<prefix>.1`, where the bridge usually sits
    pub fn gateway(&self) -> String {
        format!("{}.1", self.0)
    }

    /// `<prefix>.254`, the other conventional router address
    pub fn last_host(&self) -> String {
        format!("{}.254", self.0)
    }

    /// The full /24, if the prefix is well formed
    pub fn network(&self) -> Option<Ipv4Net> {
        format!("{}.0/24", self.0).parse().ok()
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Destination of a route line as a network (`default` yields `None`)
fn route_destination(line: &str) -> Option<Ipv4Net> {
    let dest = line.split_whitespace().next()?;
    dest.parse::<Ipv4Net>()
        .ok()
        .or_else(|| Ipv4Net::new(dest.parse::<Ipv4Addr>().ok()?, 32).ok())
}

/// Every IPv4 address on a route line (gateway, preferred source, ...)
fn route_addresses(line: &str) -> impl Iterator<Item = Ipv4Addr> + '_ {
    line.split_whitespace()
        .filter_map(|tok| tok.split('/').next())
        .filter_map(|tok| tok.parse::<Ipv4Addr>().ok())
}

/// Picks and remembers the subnet used by a host bridge
pub struct SubnetAllocator<'a> {
    runner: &'a dyn ProcessRunner,
}

impl<'a> SubnetAllocator<'a> {
    pub fn new(runner: &'a dyn ProcessRunner) -> Self {
        Self { runner }
    }

    fn routes(&self) -> String {
        self.runner
            .output_of(&ProcessSpec::new("ip").args(["-4", "route", "show"]))
    }

    /// Subnet of the first route going through `bridge_name`
    fn virtual_switch_subnet(&self, bridge_name: &str) -> Option<Subnet> {
        let subnet = self
            .routes()
            .lines()
            .filter(|line| line.split_whitespace().any(|tok| tok == bridge_name))
            .find_map(route_destination)
            .map(|net| Subnet::from_addr(net.network()));

        if subnet.is_none() {
            tracing::info!("Unable to determine subnet for the {} subnet", bridge_name);
        }
        subnet
    }

    fn used_locally(&self, subnet: &Subnet) -> bool {
        let Some(candidate) = subnet.network() else {
            return true;
        };

        self.routes().lines().any(|line| {
            route_destination(line)
                .is_some_and(|net| net.contains(&candidate) || candidate.contains(&net))
                || route_addresses(line).any(|addr| candidate.contains(&addr))
        })
    }

    fn can_reach(&self, ip: &str) -> bool {
        self.runner.succeeds(
            &ProcessSpec::new("ping").args(["-n", "-q", ip, "-c", "1", "-W", "1"]),
        )
    }

    fn answers_on_gateway(&self, subnet: &Subnet) -> bool {
        self.can_reach(&subnet.gateway()) || self.can_reach(&subnet.last_host())
    }

    /// Draw `10.A.B` candidates until one is neither routed nor answering
    pub fn generate_random_subnet<R: Rng>(&self, rng: &mut R) -> Result<Subnet, SubnetError> {
        for attempt in 0..MAX_ATTEMPTS {
            let a = rng.random_range(0..=255u8);
            let b = rng.random_range(0..=255u8);
            let candidate = Subnet::from_octets(10, a, b);

            if self.used_locally(&candidate) || self.answers_on_gateway(&candidate) {
                tracing::debug!(subnet = %candidate, attempt, "Subnet candidate in use");
                continue;
            }

            return Ok(candidate);
        }

        Err(SubnetError::Exhausted)
    }

    /// Subnet for `bridge_name`, seeding the generator from the clock
    pub fn get_subnet(&self, network_dir: &Path, bridge_name: &str) -> Result<Subnet, SubnetError> {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        let mut rng = StdRng::seed_from_u64(seed);
        self.get_subnet_with(network_dir, bridge_name, &mut rng)
    }

    /// Subnet for `bridge_name`
    ///
    /// A live route through the bridge wins, then the persisted prefix, then
    /// a fresh allocation which is written back.
    pub fn get_subnet_with<R: Rng>(
        &self,
        network_dir: &Path,
        bridge_name: &str,
        rng: &mut R,
    ) -> Result<Subnet, SubnetError> {
        if let Some(subnet) = self.virtual_switch_subnet(bridge_name) {
            return Ok(subnet);
        }

        let path = network_dir.join(SUBNET_FILE);
        let persist = |source| SubnetError::Persist {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(network_dir).map_err(persist)?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(persist)?;

        let mut stored = String::new();
        file.read_to_string(&mut stored).map_err(persist)?;
        if !stored.trim().is_empty() {
            return Ok(Subnet::from_persisted(&stored));
        }

        let subnet = self.generate_random_subnet(rng)?;
        file.set_len(0).map_err(persist)?;
        file.seek(SeekFrom::Start(0)).map_err(persist)?;
        file.write_all(subnet.as_str().as_bytes()).map_err(persist)?;
        tracing::info!(subnet = %subnet, path = %path.display(), "Allocated subnet");

        Ok(subnet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{exited, FakeRunner};
    use std::cell::Cell;
    use std::rc::Rc;
    use tempfile::TempDir;

    const ROUTES: &str = "default via 192.168.1.1 dev wlp2s0 proto dhcp metric 600\n\
                          10.99.1.0/24 dev mpqemubr0 proto kernel scope link src 10.99.1.1\n\
                          192.168.1.0/24 dev wlp2s0 proto kernel scope link src 192.168.1.20\n";

    fn host(routes: impl Into<String>, ping_answers: bool) -> FakeRunner {
        let routes = routes.into();
        FakeRunner::new(move |spec| match spec.display_name().as_str() {
            "ip" => exited(0, &routes, ""),
            "ping" => exited(if ping_answers { 0 } else { 1 }, "", ""),
            other => panic!("unexpected program {}", other),
        })
    }

    fn pinged(runner: &FakeRunner) -> Vec<String> {
        runner
            .calls()
            .iter()
            .filter(|s| s.display_name() == "ping")
            .map(|s| s.args_lossy()[2].clone())
            .collect()
    }

    #[test]
    fn test_subnet_addresses() {
        let subnet = Subnet::from_octets(10, 4, 200);
        assert_eq!(subnet.as_str(), "10.4.200");
        assert_eq!(subnet.gateway(), "10.4.200.1");
        assert_eq!(subnet.last_host(), "10.4.200.254");
        assert_eq!(subnet.network(), Some("10.4.200.0/24".parse().unwrap()));
        assert_eq!(Subnet::from_persisted("junk").network(), None);
    }

    #[test]
    fn test_route_destination() {
        assert_eq!(route_destination("default via 1.2.3.4 dev eth0"), None);
        assert_eq!(
            route_destination("10.0.3.0/24 dev lxcbr0"),
            Some("10.0.3.0/24".parse().unwrap())
        );
        assert_eq!(
            route_destination("10.0.3.7 dev tun0"),
            Some("10.0.3.7/32".parse().unwrap())
        );
    }

    #[test]
    fn test_existing_bridge_route_wins() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(SUBNET_FILE), "10.1.1").unwrap();
        let runner = host(ROUTES, false);

        let subnet = SubnetAllocator::new(&runner)
            .get_subnet_with(dir.path(), "mpqemubr0", &mut StdRng::seed_from_u64(1))
            .unwrap();

        assert_eq!(subnet.as_str(), "10.99.1");
        assert_eq!(runner.count(), 1);
    }

    #[test]
    fn test_persisted_subnet_is_reused() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(SUBNET_FILE), "10.42.7\n").unwrap();
        let runner = host(ROUTES, true);

        let subnet = SubnetAllocator::new(&runner)
            .get_subnet_with(dir.path(), "otherbr0", &mut StdRng::seed_from_u64(1))
            .unwrap();

        assert_eq!(subnet.as_str(), "10.42.7");
        assert!(pinged(&runner).is_empty());
    }

    #[test]
    fn test_allocation_is_persisted() {
        let dir = TempDir::new().unwrap();
        let net_dir = dir.path().join("network");
        let runner = host(ROUTES, false);
        let allocator = SubnetAllocator::new(&runner);

        let first = allocator
            .get_subnet_with(&net_dir, "otherbr0", &mut StdRng::seed_from_u64(3))
            .unwrap();
        assert!(first.as_str().starts_with("10."));
        assert_eq!(
            fs::read_to_string(net_dir.join(SUBNET_FILE)).unwrap(),
            first.as_str()
        );

        let again = allocator
            .get_subnet_with(&net_dir, "otherbr0", &mut StdRng::seed_from_u64(99))
            .unwrap();
        assert_eq!(again, first);
    }

    #[test]
    fn test_routed_candidate_is_skipped() {
        let mut expected = StdRng::seed_from_u64(7);
        let a = expected.random_range(0..=255u8);
        let b = expected.random_range(0..=255u8);
        let taken = Subnet::from_octets(10, a, b);
        let runner = host(format!("{}.0/24 dev virbr0 proto kernel\n", taken), false);

        let subnet = SubnetAllocator::new(&runner)
            .generate_random_subnet(&mut StdRng::seed_from_u64(7))
            .unwrap();

        assert_ne!(subnet, taken);
        assert!(!pinged(&runner).contains(&taken.gateway()));
    }

    #[test]
    fn test_gateway_and_source_addresses_count_as_used() {
        let mut expected = StdRng::seed_from_u64(42);
        let a = expected.random_range(0..=255u8);
        let b = expected.random_range(0..=255u8);
        let taken = Subnet::from_octets(10, a, b);
        let runner = host(
            format!(
                "default via {}.1 dev tun0 onlink\n\
                 172.16.0.0/12 via {}.7 dev tun0 onlink\n",
                taken, taken
            ),
            false,
        );

        let subnet = SubnetAllocator::new(&runner)
            .generate_random_subnet(&mut StdRng::seed_from_u64(42))
            .unwrap();

        assert_ne!(subnet, taken);
    }

    #[test]
    fn test_route_addresses() {
        let line = "10.99.1.0/24 dev mpqemubr0 proto kernel scope link src 10.99.1.1";
        let addrs: Vec<_> = route_addresses(line).collect();
        assert_eq!(
            addrs,
            vec![Ipv4Addr::new(10, 99, 1, 0), Ipv4Addr::new(10, 99, 1, 1)]
        );
        assert_eq!(route_addresses("default dev wg0 scope link").count(), 0);
    }

    #[test]
    fn test_blank_subnet_file_is_overwritten() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(SUBNET_FILE), "\n  \n").unwrap();
        let runner = host(ROUTES, false);

        let subnet = SubnetAllocator::new(&runner)
            .get_subnet_with(dir.path(), "otherbr0", &mut StdRng::seed_from_u64(8))
            .unwrap();

        assert_eq!(
            fs::read_to_string(dir.path().join(SUBNET_FILE)).unwrap(),
            subnet.as_str()
        );
    }

    #[test]
    fn test_answering_candidates_are_skipped() {
        let answered = Rc::new(Cell::new(0));
        let counter = answered.clone();
        // first three candidates answer on .254
        let runner = FakeRunner::new(move |spec| match spec.display_name().as_str() {
            "ip" => exited(0, "", ""),
            _ if spec.args_lossy()[2].ends_with(".254") && counter.get() < 3 => {
                counter.set(counter.get() + 1);
                exited(0, "", "")
            }
            _ => exited(1, "", ""),
        });

        let subnet = SubnetAllocator::new(&runner)
            .generate_random_subnet(&mut StdRng::seed_from_u64(11))
            .unwrap();

        let pings = pinged(&runner);
        assert_eq!(answered.get(), 3);
        assert_eq!(pings.len(), 8);
        assert_eq!(pings[6], subnet.gateway());
        assert_eq!(pings[7], subnet.last_host());
    }

    #[test]
    fn test_never_returns_routed_or_answering_subnet() {
        for seed in 0..20 {
            let runner = FakeRunner::new(|spec| match spec.display_name().as_str() {
                "ip" => exited(0, "10.0.0.0/9 dev big0\n", ""),
                _ => exited(1, "", ""),
            });

            let subnet = SubnetAllocator::new(&runner)
                .generate_random_subnet(&mut StdRng::seed_from_u64(seed))
                .unwrap();

            let net = subnet.network().unwrap();
            assert!(net.network().octets()[1] >= 128, "{} is routed", subnet);
        }
    }

    #[test]
    fn test_exhausted_when_everything_answers() {
        let runner = host("", true);

        let err = SubnetAllocator::new(&runner)
            .generate_random_subnet(&mut StdRng::seed_from_u64(5))
            .unwrap_err();

        assert!(matches!(err, SubnetError::Exhausted));
        assert_eq!(err.to_string(), "Could not determine a subnet for networking.");
        assert_eq!(pinged(&runner).len(), MAX_ATTEMPTS);
    }

    #[test]
    fn test_ping_arguments() {
        let runner = host("", false);
        SubnetAllocator::new(&runner)
            .generate_random_subnet(&mut StdRng::seed_from_u64(0))
            .unwrap();

        let ping = runner
            .calls()
            .into_iter()
            .find(|s| s.display_name() == "ping")
            .unwrap();
        let args = ping.args_lossy();
        assert_eq!(args[..2], ["-n", "-q"]);
        assert_eq!(args[3..], ["-c", "1", "-W", "1"]);
    }

    #[test]
    fn test_unwritable_directory_reports_path() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "x").unwrap();
        let runner = host("", false);

        let err = SubnetAllocator::new(&runner)
            .get_subnet_with(&blocker.join("net"), "br0", &mut StdRng::seed_from_u64(0))
            .unwrap_err();

        match err {
            SubnetError::Persist { path, .. } => assert!(path.ends_with(SUBNET_FILE)),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
