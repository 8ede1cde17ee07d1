//! Test asset resolution against a topology snapshot.

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use super::{AssetScope, PrepareError, Strategy, TestDefinition};
use crate::controlplane::{ControlPlane, Topology};

/// A node pair targeted by a test. Sessions run in both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Asset {
    /// Link name for link-scoped tests, node name for node-scoped tests.
    pub name: String,
    pub src_node_mac: String,
    pub dst_node_mac: String,
    pub link_name: Option<String>,
    /// Hop distance between the endpoints.
    pub hops: usize,
}

/// Output of a successful [`prepare`].
#[derive(Debug, Clone)]
pub struct PreparedTest {
    pub assets: Vec<Asset>,
    pub estimated_duration: Duration,
}

/// Resolve the ordered asset list for `definition`, applying its allow-list.
pub fn resolve_assets(topology: &Topology, definition: &TestDefinition) -> Vec<Asset> {
    let mut assets: Vec<Asset> = match definition.test_type.scope() {
        AssetScope::Link => topology
            .wireless_links()
            .map(|link| Asset {
                name: link.name.clone(),
                src_node_mac: link.a_node_mac.clone(),
                dst_node_mac: link.z_node_mac.clone(),
                link_name: Some(link.name.clone()),
                hops: 1,
            })
            .collect(),
        AssetScope::Node => {
            let nearest = topology.nearest_pops();
            topology
                .nodes
                .iter()
                .filter(|node| !node.pop_node)
                .filter_map(|node| {
                    let (pop_name, hops) = nearest.get(node.name.as_str())?;
                    let pop = topology.node(pop_name)?;
                    Some(Asset {
                        name: node.name.clone(),
                        src_node_mac: node.mac_addr.clone(),
                        dst_node_mac: pop.mac_addr.clone(),
                        link_name: None,
                        hops: *hops,
                    })
                })
                .collect()
        }
    };

    assets.retain(|asset| definition.allows(&asset.name));

    // Multihop walks outward from the POPs.
    if definition.test_type.strategy() == Strategy::Multihop {
        assets.sort_by_key(|asset| asset.hops);
    }

    assets
}

/// Fetch the topology and resolve the assets and estimated duration.
pub async fn prepare(
    control_plane: &dyn ControlPlane,
    definition: &TestDefinition,
) -> Result<PreparedTest, PrepareError> {
    let network = &definition.network_name;
    let topology = control_plane
        .get_topology(network)
        .await
        .map_err(|source| PrepareError::Topology {
            network: network.clone(),
            source,
        })?;

    let assets = resolve_assets(&topology, definition);
    if assets.is_empty() {
        return Err(if definition.allow_list.is_some() {
            warn!(network = %network, "no assets match the allow-list");
            PrepareError::NoMatchingAssets(network.clone())
        } else {
            PrepareError::NoAssets(network.clone())
        });
    }

    let estimated_duration = definition.estimate_duration(assets.len());
    debug!(
        network = %network,
        test_type = %definition.test_type,
        assets = assets.len(),
        ?estimated_duration,
        "prepared test"
    );

    Ok(PreparedTest {
        assets,
        estimated_duration,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::{Link, LinkType, Node};
    use crate::network_test::{TestType, TrafficOptions};

    fn topology() -> Topology {
        let node = |name: &str, pop_node: bool| Node {
            name: name.to_string(),
            mac_addr: format!("mac-{}", name),
            pop_node,
        };
        let link = |a: &str, z: &str, link_type: LinkType| Link {
            name: format!("link-{}-{}", a, z),
            a_node_name: a.to_string(),
            z_node_name: z.to_string(),
            a_node_mac: format!("mac-{}", a),
            z_node_mac: format!("mac-{}", z),
            link_type,
        };

        Topology {
            name: "net1".to_string(),
            nodes: vec![node("far", false), node("pop", true), node("near", false), node("dn", false)],
            links: vec![
                link("pop", "near", LinkType::Wireless),
                link("near", "far", LinkType::Wireless),
                link("pop", "dn", LinkType::Ethernet),
            ],
        }
    }

    fn definition(test_type: TestType, allow: &[&str]) -> TestDefinition {
        let allow_list = if allow.is_empty() {
            None
        } else {
            Some(allow.iter().map(|s| s.to_string()).collect())
        };
        TestDefinition::new("net1", test_type, TrafficOptions::default(), allow_list)
    }

    #[test]
    fn test_link_scope_uses_wireless_links_only() {
        let assets = resolve_assets(&topology(), &definition(TestType::ParallelLink, &[]));
        let names: Vec<_> = assets.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["link-pop-near", "link-near-far"]);
        assert_eq!(assets[0].src_node_mac, "mac-pop");
        assert_eq!(assets[0].dst_node_mac, "mac-near");
        assert_eq!(assets[0].link_name.as_deref(), Some("link-pop-near"));
    }

    #[test]
    fn test_node_scope_pairs_with_nearest_pop() {
        let assets = resolve_assets(&topology(), &definition(TestType::SequentialNode, &[]));
        let names: Vec<_> = assets.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["far", "near", "dn"]);
        assert!(assets.iter().all(|a| a.dst_node_mac == "mac-pop"));
        assert_eq!(assets[0].hops, 2);
    }

    #[test]
    fn test_multihop_orders_by_hops() {
        let assets = resolve_assets(&topology(), &definition(TestType::Multihop, &[]));
        let hops: Vec<_> = assets.iter().map(|a| a.hops).collect();
        assert_eq!(hops, vec![1, 1, 2]);
        assert_eq!(assets[2].name, "far");
    }

    #[test]
    fn test_allow_list_filters_by_name() {
        let assets = resolve_assets(
            &topology(),
            &definition(TestType::ParallelLink, &["link-near-far", "missing"]),
        );
        assert_eq!(assets.len(), 1);
        assert_eq!(assets[0].name, "link-near-far");
    }

    #[test]
    fn test_allow_list_with_no_match_is_empty() {
        let assets = resolve_assets(&topology(), &definition(TestType::ParallelNode, &["ghost"]));
        assert!(assets.is_empty());
    }
}
