//! Property tests over random assign/release sequences

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use proptest::prelude::*;
use tenant_network::{
    derive_mac, MemoryControlPlane, MemoryStore, ReconciliationEngine, SubnetAllocator, MAC_OUI,
};

#[derive(Debug, Clone)]
enum Op {
    Assign { tenant: u8, vm: u8 },
    Release { tenant: u8, vm: u8 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u8..4, 0u8..8).prop_map(|(tenant, vm)| Op::Assign { tenant, vm }),
        1 => (0u8..4, 0u8..8).prop_map(|(tenant, vm)| Op::Release { tenant, vm }),
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn create_engine() -> (ReconciliationEngine, Arc<MemoryControlPlane>) {
    let control_plane = Arc::new(MemoryControlPlane::new());
    let engine = ReconciliationEngine::new(
        Arc::new(MemoryStore::new()),
        SubnetAllocator::new(200, 10, 20).unwrap(),
        control_plane.clone(),
    );
    (engine, control_plane)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_random_sequences_keep_networks_consistent(
        ops in proptest::collection::vec(op_strategy(), 1..40)
    ) {
        runtime().block_on(async {
            let (engine, cp) = create_engine();
            let mut live: HashMap<(u8, u8), std::net::Ipv4Addr> = HashMap::new();

            for op in &ops {
                match *op {
                    Op::Assign { tenant, vm } => {
                        let tenant_id = format!("tenant{}", tenant);
                        let vm_name = format!("vm{}", vm);
                        let assignment = engine.assign_static_ip(&tenant_id, &vm_name).await.unwrap();
                        prop_assert_eq!(assignment.mac, derive_mac(&tenant_id, &vm_name));
                        if let Some(previous) = live.insert((tenant, vm), assignment.ip) {
                            // Repeat assignment is stable while the VM holds its address
                            prop_assert_eq!(previous, assignment.ip);
                        }
                    }
                    Op::Release { tenant, vm } => {
                        engine
                            .release_static_ip(&format!("tenant{}", tenant), &format!("vm{}", vm))
                            .await
                            .unwrap();
                        live.remove(&(tenant, vm));
                    }
                }
            }

            let networks = engine.networks().await.unwrap();
            let subnets: HashSet<_> = networks.iter().map(|n| n.subnet_cidr).collect();
            prop_assert_eq!(subnets.len(), networks.len());

            let mut total = 0;
            for network in &networks {
                network.validate().unwrap();
                total += network.allocations.len();

                // DHCP table mirrors the persisted allocations exactly
                let mut hosts: Vec<_> = cp
                    .hosts(&network.network_name)
                    .into_iter()
                    .map(|h| (h.name, h.ip, h.mac))
                    .collect();
                let mut expected: Vec<_> = network
                    .allocations
                    .iter()
                    .map(|a| (a.vm_name.clone(), a.ip_address, a.mac_address))
                    .collect();
                hosts.sort();
                expected.sort();
                prop_assert_eq!(hosts, expected);
            }
            prop_assert_eq!(total, live.len());
            Ok(())
        })?;
    }

    #[test]
    fn test_mac_derivation_is_pure_and_local(
        tenant in "[a-zA-Z0-9_-]{1,16}",
        vm in "[a-zA-Z0-9_.-]{1,32}",
    ) {
        let mac = derive_mac(&tenant, &vm);
        prop_assert_eq!(mac, derive_mac(&tenant, &vm));
        prop_assert_eq!(&mac.octets()[..3], &MAC_OUI[..]);
        prop_assert!(mac.is_locally_administered());
    }

    #[test]
    fn test_first_fit_fills_lowest_free_block(
        used in proptest::collection::btree_set(10u8..=20, 0..11)
    ) {
        let allocator = SubnetAllocator::new(200, 10, 20).unwrap();
        let taken = used.iter().map(|octet| allocator.block(*octet)).collect();

        let picked = allocator.allocate(&taken).unwrap();
        let lowest_free = (10u8..=20).find(|o| !used.contains(o)).unwrap();
        prop_assert_eq!(picked, allocator.block(lowest_free));
        prop_assert_eq!(allocator.available_count(&taken), 11 - used.len());
    }
}
