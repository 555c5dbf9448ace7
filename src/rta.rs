use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::debug;

use crate::graph::{ClassGraph, ClassId, MethodId, Pin};

/// How virtual and interface call sites are resolved.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum DispatchMode {
    /// Confirm dispatch targets only for instantiated receivers.
    #[default]
    Rta,
    /// Every override in the receiver subtree is a target.
    Cha,
    /// CHA fixpoint followed by retraction of edges no instantiated class supports.
    ChaPrune,
}

impl DispatchMode {
    /// Whether the instantiation set gates confirmation during the fixpoint.
    pub(crate) fn gates_dispatch(self) -> bool {
        self == DispatchMode::Rta
    }
}

impl FromStr for DispatchMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        <Self as ValueEnum>::from_str(value.trim(), true)
    }
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_possible_value() {
            Some(value) => f.write_str(value.get_name()),
            None => write!(f, "{self:?}"),
        }
    }
}

/// Classes observed as constructed. Grows monotonically.
#[derive(Debug, Default)]
pub(crate) struct InstantiationSet {
    classes: BTreeSet<ClassId>,
}

impl InstantiationSet {
    pub(crate) fn contains(&self, class: ClassId) -> bool {
        self.classes.contains(&class)
    }

    /// Returns true when `class` was not instantiated before.
    pub(crate) fn insert(&mut self, class: ClassId) -> bool {
        self.classes.insert(class)
    }

    pub(crate) fn len(&self) -> usize {
        self.classes.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = ClassId> + '_ {
        self.classes.iter().copied()
    }
}

/// Virtual edge waiting for an instantiated receiver that dispatches to `target`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct PendingEdge {
    pub(crate) caller: MethodId,
    pub(crate) target: MethodId,
    /// Static receiver type of the call site.
    pub(crate) receiver: ClassId,
}

/// Pending edges indexed by the class declaring the target.
#[derive(Debug, Default)]
pub(crate) struct PendingEdges {
    by_owner: FxHashMap<ClassId, BTreeSet<PendingEdge>>,
}

impl PendingEdges {
    pub(crate) fn insert(&mut self, owner: ClassId, edge: PendingEdge) {
        self.by_owner.entry(owner).or_default().insert(edge);
    }

    /// Remove and return the edges declared on `owner` accepted by `ready`.
    pub(crate) fn take_ready<F>(&mut self, owner: ClassId, mut ready: F) -> Vec<PendingEdge>
    where
        F: FnMut(&PendingEdge) -> bool,
    {
        let Some(edges) = self.by_owner.get_mut(&owner) else {
            return Vec::new();
        };
        let taken: Vec<PendingEdge> = edges.iter().filter(|edge| ready(edge)).copied().collect();
        for edge in &taken {
            edges.remove(edge);
        }
        if edges.is_empty() {
            self.by_owner.remove(&owner);
        }
        taken
    }

    pub(crate) fn len(&self) -> usize {
        self.by_owner.values().map(BTreeSet::len).sum()
    }
}

/// True when some instantiated class dispatches to `target`.
pub(crate) fn is_supported(graph: &ClassGraph, instantiated: &InstantiationSet, target: MethodId) -> bool {
    let method = graph.method(target);
    graph.subtree(method.owner).into_iter().any(|class| {
        instantiated.contains(class)
            && graph.resolve_virtual(class, &method.name, &method.descriptor) == Some(target)
    })
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub(crate) struct RetractionStats {
    pub(crate) edges: usize,
    pub(crate) methods: usize,
    pub(crate) classes: usize,
}

#[derive(Clone, Copy, Debug)]
enum Node {
    Method(MethodId),
    Class(ClassId),
}

/// Remove every confirmed virtual edge whose target no instantiated class dispatches
/// to, then release whatever loses its last caller, user or dependent. Methods and
/// classes kept alive only by a cycle among themselves stay used.
pub(crate) fn retract_unsupported_edges(
    graph: &mut ClassGraph,
    instantiated: &InstantiationSet,
) -> RetractionStats {
    let mut stats = RetractionStats::default();
    let mut queue = VecDeque::new();

    let callers: Vec<MethodId> = graph
        .method_ids()
        .filter(|id| graph.method(*id).used && !graph.method(*id).virtual_callees.is_empty())
        .collect();
    for caller in callers {
        let targets: Vec<MethodId> = graph.method(caller).virtual_callees.iter().copied().collect();
        for target in targets {
            if is_supported(graph, instantiated, target) {
                continue;
            }
            graph.method_mut(caller).virtual_callees.remove(&target);
            stats.edges += 1;
            release_call(graph, caller, target, &mut queue);
        }
    }

    while let Some(node) = queue.pop_front() {
        match node {
            Node::Method(id) => {
                if !method_unsupported(graph, id) {
                    continue;
                }
                retract_method(graph, id, &mut queue);
                stats.methods += 1;
            }
            Node::Class(id) => {
                if !class_unsupported(graph, id) {
                    continue;
                }
                retract_class(graph, id, &mut queue);
                stats.classes += 1;
            }
        }
    }

    debug!(
        edges = stats.edges,
        methods = stats.methods,
        classes = stats.classes,
        "retraction finished"
    );
    stats
}

/// Drop `caller` from `target.callers` unless a static edge still links them.
fn release_call(graph: &mut ClassGraph, caller: MethodId, target: MethodId, queue: &mut VecDeque<Node>) {
    let caller_node = graph.method(caller);
    if caller_node.static_callees.contains(&target) || caller_node.virtual_callees.contains(&target) {
        return;
    }
    graph.method_mut(target).callers.remove(&caller);
    if method_unsupported(graph, target) {
        queue.push_back(Node::Method(target));
    }
}

fn method_unsupported(graph: &ClassGraph, id: MethodId) -> bool {
    let method = graph.method(id);
    method.used && method.callers.is_empty() && method.pin.is_none()
}

fn class_unsupported(graph: &ClassGraph, id: ClassId) -> bool {
    let class = graph.class(id);
    class.used && class.users.is_empty() && class.dependents.is_empty() && class.pin.is_none()
}

fn retract_method(graph: &mut ClassGraph, id: MethodId, queue: &mut VecDeque<Node>) {
    let method = graph.method_mut(id);
    method.used = false;
    let callees: BTreeSet<MethodId> = std::mem::take(&mut method.static_callees)
        .into_iter()
        .chain(std::mem::take(&mut method.virtual_callees))
        .collect();
    let mut required: Vec<ClassId> = std::mem::take(&mut method.dependent_classes)
        .into_iter()
        .collect();
    required.push(method.owner);
    debug!(method = %describe(graph, id), "retracted");

    for callee in callees {
        graph.method_mut(callee).callers.remove(&id);
        if method_unsupported(graph, callee) {
            queue.push_back(Node::Method(callee));
        }
    }
    for class in required {
        graph.class_mut(class).users.remove(&id);
        if class_unsupported(graph, class) {
            queue.push_back(Node::Class(class));
        }
    }
}

fn retract_class(graph: &mut ClassGraph, id: ClassId, queue: &mut VecDeque<Node>) {
    let class = graph.class_mut(id);
    class.used = false;
    let mut required: Vec<ClassId> = class.dependencies.iter().copied().collect();
    required.extend(class.super_node);
    required.extend(class.interface_nodes.iter().copied());
    debug!(class = %graph.class(id).name, "retracted");

    if let Some(initializer) = graph.find_method(id, "<clinit>", "()V") {
        let method = graph.method_mut(initializer);
        if method.pin == Some(Pin::ClassInit) {
            method.pin = None;
            if method_unsupported(graph, initializer) {
                queue.push_back(Node::Method(initializer));
            }
        }
    }
    for required in required {
        graph.class_mut(required).dependents.remove(&id);
        if class_unsupported(graph, required) {
            queue.push_back(Node::Class(required));
        }
    }
}

pub(crate) fn describe(graph: &ClassGraph, id: MethodId) -> String {
    let method = graph.method(id);
    format!(
        "{}.{}{}",
        graph.class(method.owner).name,
        method.name,
        method.descriptor
    )
}
