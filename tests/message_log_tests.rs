//! Delta accumulation and broadcast targeting hold for arbitrary inputs.

use proptest::prelude::*;

use resviz_sync::{MessageLog, Patch, Role};

proptest! {
    #[test]
    fn prop_deltas_concatenate_in_arrival_order(
        deltas in proptest::collection::vec(("\\PC{0,12}", "\\PC{0,12}"), 0..32),
    ) {
        let mut log = MessageLog::new();
        log.create_from_patch(&Patch::new("m").role(Role::Assistant)).unwrap();
        for (content, thinking) in &deltas {
            log.apply_to_message("m", &Patch::new("m").content(content.as_str()).thinking(thinking.as_str()));
        }

        let m = log.get("m").unwrap();
        let content: String = deltas.iter().map(|(c, _)| c.as_str()).collect();
        let thinking: String = deltas.iter().map(|(_, t)| t.as_str()).collect();
        prop_assert_eq!(&m.content, &content);
        prop_assert_eq!(&m.thinking, &thinking);
    }

    #[test]
    fn prop_broadcast_reaches_exactly_the_generating_messages(
        finished in proptest::collection::vec(any::<bool>(), 1..12),
        delta in "\\PC{1,8}",
    ) {
        let mut log = MessageLog::new();
        for (i, done) in finished.iter().enumerate() {
            let mut patch = Patch::new(format!("m{i}")).role(Role::Assistant);
            if *done {
                patch = patch.finished();
            }
            log.create_from_patch(&patch).unwrap();
        }

        let touched = log.apply_to_all_generating(&Patch::broadcast().content(delta.as_str()));

        let expected: Vec<String> = finished
            .iter()
            .enumerate()
            .filter(|(_, done)| !**done)
            .map(|(i, _)| format!("m{i}"))
            .collect();
        prop_assert_eq!(&touched, &expected);
        for (i, done) in finished.iter().enumerate() {
            let content = &log.get(&format!("m{i}")).unwrap().content;
            if *done {
                prop_assert!(content.is_empty());
            } else {
                prop_assert_eq!(content, &delta);
            }
        }
    }
}
