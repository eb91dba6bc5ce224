//! Property tests for reference-counted session ownership.


use std::collections::HashMap;
use std::sync::Arc;

use eventsub_manager::EventSubManager;
use eventsub_stream::{FnListener, ListenerId};
use mock_transport::{account, init_tracing, MockFactory};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Attach(usize),
    /// Detach the n-th live listener of the account, if it has any.
    Detach(usize, usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0usize..3).prop_map(Op::Attach),
        (0usize..3, 0usize..4).prop_map(|(a, n)| Op::Detach(a, n)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_session_exists_iff_listeners(ops in prop::collection::vec(op_strategy(), 1..24)) {
        init_tracing();
        let manager = EventSubManager::with_factory(Arc::new(MockFactory::default())).unwrap();
        let accounts: Vec<_> = ["1001", "2002", "3003"].into_iter().map(account).collect();
        let mut live: HashMap<usize, Vec<ListenerId>> = HashMap::new();

        for op in ops {
            match op {
                Op::Attach(a) => {
                    let id = manager.attach(
                        accounts[a].clone(),
                        Arc::new(FnListener::new(|_, _| Ok(()))),
                    );
                    live.entry(a).or_default().push(id);
                }
                Op::Detach(a, n) => {
                    let listeners = live.entry(a).or_default();
                    if listeners.is_empty() {
                        continue;
                    }
                    let id = listeners.remove(n % listeners.len());
                    prop_assert!(manager.detach(&accounts[a].account_id, id));
                    prop_assert!(!manager.detach(&accounts[a].account_id, id));
                }
            }

            for (a, config) in accounts.iter().enumerate() {
                let expected = live.get(&a).map_or(0, Vec::len);
                prop_assert_eq!(manager.listener_count(&config.account_id), expected);
                prop_assert_eq!(manager.has_session(&config.account_id), expected > 0);
            }
        }

        manager.shutdown().unwrap();
    }
}
