use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::graph::{ClassGraph, MethodKey};

/// Output decision for one Local class.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ClassVerdict {
    Drop,
    /// Keep the class with only these methods, in declaration order.
    Keep(Vec<MethodKey>),
    /// Keep the class untouched.
    KeepAll,
}

impl ClassVerdict {
    pub(crate) fn keeps_method(&self, name: &str, descriptor: &str) -> bool {
        match self {
            ClassVerdict::Drop => false,
            ClassVerdict::KeepAll => true,
            ClassVerdict::Keep(methods) => methods
                .iter()
                .any(|(method_name, method_descriptor)| method_name == name && method_descriptor == descriptor),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub(crate) struct PruneStats {
    pub(crate) kept_classes: usize,
    pub(crate) dropped_classes: usize,
    pub(crate) kept_methods: usize,
    pub(crate) removed_methods: usize,
}

/// Verdicts keyed by internal class name.
#[derive(Debug, Default)]
pub(crate) struct PrunePlan {
    verdicts: FxHashMap<String, ClassVerdict>,
    pub(crate) stats: PruneStats,
}

impl PrunePlan {
    /// `None` for names the analysis never saw, which are copied through.
    pub(crate) fn verdict(&self, class: &str) -> Option<&ClassVerdict> {
        self.verdicts.get(class)
    }
}

/// Read the settled graph into per-class verdicts. With `classes_only` every used
/// class keeps all of its methods.
pub(crate) fn plan(graph: &ClassGraph, classes_only: bool) -> PrunePlan {
    let mut plan = PrunePlan::default();
    for id in graph.class_ids() {
        let class = graph.class(id);
        if !class.is_local() {
            continue;
        }
        let total = class.methods.len();
        let verdict = if !class.used {
            plan.stats.dropped_classes += 1;
            plan.stats.removed_methods += total;
            ClassVerdict::Drop
        } else if classes_only {
            plan.stats.kept_classes += 1;
            plan.stats.kept_methods += total;
            ClassVerdict::KeepAll
        } else {
            let methods: Vec<MethodKey> = class
                .methods
                .iter()
                .filter(|(_, method)| graph.method(**method).used)
                .map(|(key, _)| key.clone())
                .collect();
            plan.stats.kept_classes += 1;
            plan.stats.kept_methods += methods.len();
            plan.stats.removed_methods += total - methods.len();
            ClassVerdict::Keep(methods)
        };
        plan.verdicts.insert(class.name.clone(), verdict);
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{AnalysisOptions, analyze};
    use crate::ir::{CallKind, Class, InstructionKind, TypeOp};
    use crate::rta::DispatchMode;
    use crate::testing::ir::{PUBLIC, PUBLIC_ABSTRACT, PUBLIC_STATIC, call, class, construct, init, interface, main, method};

    fn program() -> Vec<Class> {
        vec![
            interface(
                "app/Shape",
                vec![
                    method(PUBLIC_ABSTRACT, "area", "()D", vec![]),
                    method(PUBLIC_ABSTRACT, "name", "()Ljava/lang/String;", vec![]),
                ],
            ),
            class(
                "app/Square",
                Some("java/lang/Object"),
                &["app/Shape"],
                vec![
                    init("java/lang/Object"),
                    method(PUBLIC, "area", "()D", vec![call(CallKind::Static, "app/Square", "side", "()D")]),
                    method(PUBLIC, "name", "()Ljava/lang/String;", vec![]),
                    method(PUBLIC_STATIC, "side", "()D", vec![]),
                    method(PUBLIC, "perimeter", "()D", vec![]),
                ],
            ),
            class(
                "app/Circle",
                Some("java/lang/Object"),
                &["app/Shape"],
                vec![init("java/lang/Object"), method(PUBLIC, "area", "()D", vec![])],
            ),
            class("app/Marker", Some("java/lang/Object"), &[], vec![]),
            class(
                "app/Main",
                Some("java/lang/Object"),
                &[],
                vec![main(
                    [
                        construct("app/Square"),
                        vec![
                            call(CallKind::Interface, "app/Shape", "area", "()D"),
                            InstructionKind::Type(TypeOp::InstanceOf, "app/Marker".to_string()),
                        ],
                    ]
                    .concat(),
                )],
            ),
        ]
    }

    fn shake(classes: Vec<Class>, classes_only: bool) -> PrunePlan {
        let mut graph = ClassGraph::new();
        for class in classes {
            graph.register_class(class);
        }
        let options = AnalysisOptions {
            root: "app/Main".to_string(),
            dispatch: DispatchMode::Rta,
            reflection_strings: true,
            ..AnalysisOptions::default()
        };
        let analysis = analyze(graph, &options).expect("analysis");
        plan(&analysis.graph, classes_only)
    }

    fn apply(plan: &PrunePlan, classes: Vec<Class>) -> Vec<Class> {
        classes
            .into_iter()
            .filter_map(|mut class| match plan.verdict(&class.name) {
                Some(ClassVerdict::Drop) => None,
                Some(verdict) => {
                    class
                        .methods
                        .retain(|method| verdict.keeps_method(&method.name, &method.descriptor));
                    Some(class)
                }
                None => Some(class),
            })
            .collect()
    }

    fn keys(pairs: &[(&str, &str)]) -> Vec<MethodKey> {
        pairs
            .iter()
            .map(|(name, descriptor)| (name.to_string(), descriptor.to_string()))
            .collect()
    }

    #[test]
    fn used_classes_keep_used_methods_in_order() {
        let plan = shake(program(), false);

        assert_eq!(plan.verdict("app/Circle"), Some(&ClassVerdict::Drop));
        assert_eq!(
            plan.verdict("app/Square"),
            Some(&ClassVerdict::Keep(keys(&[("<init>", "()V"), ("area", "()D"), ("side", "()D")])))
        );
        assert_eq!(
            plan.verdict("app/Shape"),
            Some(&ClassVerdict::Keep(keys(&[("area", "()D")])))
        );
        assert_eq!(plan.verdict("app/Marker"), Some(&ClassVerdict::Keep(Vec::new())));
        assert_eq!(plan.verdict("java/lang/Object"), None);
        assert_eq!(plan.stats.kept_classes, 4);
        assert_eq!(plan.stats.dropped_classes, 1);
        assert_eq!(plan.stats.removed_methods, 5);
    }

    #[test]
    fn classes_only_keeps_whole_method_tables() {
        let plan = shake(program(), true);

        assert_eq!(plan.verdict("app/Square"), Some(&ClassVerdict::KeepAll));
        assert_eq!(plan.verdict("app/Circle"), Some(&ClassVerdict::Drop));
        assert!(plan.verdict("app/Square").is_some_and(|verdict| verdict.keeps_method("perimeter", "()D")));
    }

    #[test]
    fn shaking_twice_removes_nothing_more() {
        let first = shake(program(), false);
        let pruned = apply(&first, program());
        let second = shake(pruned.clone(), false);

        assert_eq!(second.stats.dropped_classes, 0);
        assert_eq!(second.stats.removed_methods, 0);
        for class in &pruned {
            let all: Vec<MethodKey> = class
                .methods
                .iter()
                .map(|method| (method.name.clone(), method.descriptor.clone()))
                .collect();
            assert_eq!(second.verdict(&class.name), Some(&ClassVerdict::Keep(all)), "{}", class.name);
        }
    }
}
