use std::net::IpAddr;
use std::sync::Arc;

use ipnetwork::IpNetwork;

use super::Peer;

/// Maps destination addresses to peers. Routes are kept sorted by
/// descending prefix length so the first match is the most specific.
#[derive(Default)]
pub struct RoutingTable {
    routes: Vec<(IpNetwork, Arc<Peer>)>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, network: IpNetwork, peer: Arc<Peer>) {
        self.routes.push((network, peer));
        self.routes.sort_by(|(a, _), (b, _)| b.prefix().cmp(&a.prefix()));
    }

    pub fn remove_peer(&mut self, name: &str) {
        self.routes.retain(|(_, peer)| peer.name != name);
    }

    pub fn lookup_v4(&self, dst: [u8; 4]) -> Option<Arc<Peer>> {
        self.lookup(IpAddr::from(dst))
    }

    pub fn lookup_v6(&self, dst: [u8; 16]) -> Option<Arc<Peer>> {
        self.lookup(IpAddr::from(dst))
    }

    fn lookup(&self, addr: IpAddr) -> Option<Arc<Peer>> {
        self.routes
            .iter()
            .find(|(network, _)| network.contains(addr))
            .map(|(_, peer)| peer.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::test_peer;
    use std::str::FromStr;

    #[test]
    fn longest_prefix_wins() {
        let mut table = RoutingTable::new();
        table.insert(IpNetwork::from_str("10.0.0.0/8").unwrap(), test_peer("wide"));
        table.insert(
            IpNetwork::from_str("10.1.0.0/16").unwrap(),
            test_peer("narrow"),
        );

        assert_eq!(table.lookup_v4([10, 1, 2, 3]).unwrap().name, "narrow");
        assert_eq!(table.lookup_v4([10, 9, 9, 9]).unwrap().name, "wide");
        assert!(table.lookup_v4([192, 168, 0, 1]).is_none());
    }

    #[test]
    fn v6_lookup_matches_its_network() {
        let mut table = RoutingTable::new();
        table.insert(IpNetwork::from_str("fd00::/64").unwrap(), test_peer("six"));

        let mut inside = [0u8; 16];
        inside[0] = 0xfd;
        inside[15] = 0x01;
        assert_eq!(table.lookup_v6(inside).unwrap().name, "six");

        let mut outside = [0u8; 16];
        outside[0] = 0xfe;
        assert!(table.lookup_v6(outside).is_none());
    }

    #[test]
    fn removing_a_peer_retracts_its_routes() {
        let mut table = RoutingTable::new();
        table.insert(IpNetwork::from_str("10.0.0.0/24").unwrap(), test_peer("a"));
        table.insert(IpNetwork::from_str("10.0.1.0/24").unwrap(), test_peer("b"));

        table.remove_peer("a");
        assert!(table.lookup_v4([10, 0, 0, 1]).is_none());
        assert_eq!(table.lookup_v4([10, 0, 1, 1]).unwrap().name, "b");
    }
}
