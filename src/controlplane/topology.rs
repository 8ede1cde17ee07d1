//! Topology snapshot returned by the control plane.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Topology {
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub links: Vec<Link>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub mac_addr: String,
    #[serde(default)]
    pub pop_node: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LinkType {
    Wireless,
    Ethernet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    pub name: String,
    pub a_node_name: String,
    pub z_node_name: String,
    pub a_node_mac: String,
    pub z_node_mac: String,
    pub link_type: LinkType,
}

impl Topology {
    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn wireless_links(&self) -> impl Iterator<Item = &Link> {
        self.links
            .iter()
            .filter(|l| l.link_type == LinkType::Wireless)
    }

    /// Hop distance from every reachable node to its nearest POP, with the
    /// name of that POP. POP nodes map to themselves at distance 0.
    pub fn nearest_pops(&self) -> HashMap<&str, (&str, usize)> {
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for link in &self.links {
            adjacency
                .entry(link.a_node_name.as_str())
                .or_default()
                .push(link.z_node_name.as_str());
            adjacency
                .entry(link.z_node_name.as_str())
                .or_default()
                .push(link.a_node_name.as_str());
        }

        // Multi-source BFS from every POP.
        let mut nearest: HashMap<&str, (&str, usize)> = HashMap::new();
        let mut queue = VecDeque::new();
        for pop in self.nodes.iter().filter(|n| n.pop_node) {
            nearest.insert(pop.name.as_str(), (pop.name.as_str(), 0));
            queue.push_back(pop.name.as_str());
        }

        while let Some(current) = queue.pop_front() {
            let (pop, hops) = nearest[current];
            for &neighbor in adjacency.get(current).into_iter().flatten() {
                if !nearest.contains_key(neighbor) {
                    nearest.insert(neighbor, (pop, hops + 1));
                    queue.push_back(neighbor);
                }
            }
        }

        nearest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(a: &str, z: &str, link_type: LinkType) -> Link {
        Link {
            name: format!("link-{}-{}", a, z),
            a_node_name: a.to_string(),
            z_node_name: z.to_string(),
            a_node_mac: format!("mac-{}", a),
            z_node_mac: format!("mac-{}", z),
            link_type,
        }
    }

    fn node(name: &str, pop_node: bool) -> Node {
        Node {
            name: name.to_string(),
            mac_addr: format!("mac-{}", name),
            pop_node,
        }
    }

    #[test]
    fn test_nearest_pops_chain() {
        let topology = Topology {
            name: "net".to_string(),
            nodes: vec![node("pop", true), node("a", false), node("b", false), node("island", false)],
            links: vec![
                link("pop", "a", LinkType::Wireless),
                link("a", "b", LinkType::Wireless),
            ],
        };

        let nearest = topology.nearest_pops();
        assert_eq!(nearest["pop"], ("pop", 0));
        assert_eq!(nearest["a"], ("pop", 1));
        assert_eq!(nearest["b"], ("pop", 2));
        assert!(!nearest.contains_key("island"));
    }

    #[test]
    fn test_wireless_links_filter() {
        let topology = Topology {
            name: "net".to_string(),
            nodes: vec![],
            links: vec![
                link("a", "b", LinkType::Wireless),
                link("b", "c", LinkType::Ethernet),
            ],
        };
        assert_eq!(topology.wireless_links().count(), 1);
    }

    #[test]
    fn test_parse_topology_json() {
        let json = r#"{
            "name": "net1",
            "nodes": [{"name": "pop", "mac_addr": "00:00:00:00:00:01", "pop_node": true}],
            "links": [{
                "name": "link-pop-a", "a_node_name": "pop", "z_node_name": "a",
                "a_node_mac": "00:00:00:00:00:01", "z_node_mac": "00:00:00:00:00:02",
                "link_type": "WIRELESS"
            }]
        }"#;
        let topology: Topology = serde_json::from_str(json).unwrap();
        assert_eq!(topology.name, "net1");
        assert!(topology.nodes[0].pop_node);
        assert_eq!(topology.links[0].link_type, LinkType::Wireless);
    }
}
