use std::collections::VecDeque;

use rustc_hash::FxHashSet;
use serde::Serialize;
use tracing::{debug, warn};

use crate::descriptor::{Dependencies, reflective_class_name};
use crate::error::ShakeError;
use crate::graph::{ClassGraph, ClassId, MethodId, Pin};
use crate::ir::{CallKind, Constant, HandleKind, InstructionKind, MethodHandle, TypeOp};
use crate::rta::{
    self, DispatchMode, InstantiationSet, PendingEdge, PendingEdges, RetractionStats, describe,
};
use crate::scan::ProviderRegistration;

const ENTRY_DESCRIPTOR: &str = "([Ljava/lang/String;)V";

/// Inputs of a reachability run. Class names are in internal form.
#[derive(Clone, Debug, Default)]
pub(crate) struct AnalysisOptions {
    pub(crate) root: String,
    pub(crate) keep: Vec<String>,
    pub(crate) providers: Vec<ProviderRegistration>,
    pub(crate) dispatch: DispatchMode,
    /// Treat string constants shaped like class names as reflective loads.
    pub(crate) reflection_strings: bool,
}

#[derive(Clone, Debug, Default, Serialize)]
pub(crate) struct AnalysisStats {
    pub(crate) classes_total: usize,
    pub(crate) classes_visited: usize,
    pub(crate) classes_used: usize,
    pub(crate) methods_total: usize,
    pub(crate) methods_used: usize,
    pub(crate) methods_scanned: usize,
    pub(crate) instantiated: usize,
    pub(crate) pending_edges: usize,
    pub(crate) retraction: RetractionStats,
}

/// Settled graph with used flags, plus what the run observed.
pub(crate) struct Analysis {
    pub(crate) graph: ClassGraph,
    pub(crate) instantiated: InstantiationSet,
    pub(crate) stats: AnalysisStats,
}

/// Why a class is required; recorded so the retraction pass can release it.
#[derive(Clone, Copy, Debug)]
enum Support {
    Pin(Pin),
    Method(MethodId),
    Class(ClassId),
}

/// Run the fixpoint over `graph` and return it with every reachable class and
/// method marked used.
pub(crate) fn analyze(mut graph: ClassGraph, options: &AnalysisOptions) -> Result<Analysis, ShakeError> {
    graph.build_hierarchy();
    let mut engine = Engine {
        graph,
        options,
        instantiated: InstantiationSet::default(),
        pending: PendingEdges::default(),
        worklist: VecDeque::new(),
        scanned: 0,
    };
    engine.seed()?;
    engine.run();

    let retraction = if options.dispatch == DispatchMode::ChaPrune {
        rta::retract_unsupported_edges(&mut engine.graph, &engine.instantiated)
    } else {
        RetractionStats::default()
    };

    let graph = engine.graph;
    let stats = AnalysisStats {
        classes_total: graph.local_class_count(),
        classes_visited: graph.visited_class_count(),
        classes_used: graph.used_class_count(),
        methods_total: graph.local_method_count(),
        methods_used: graph.used_method_count(),
        methods_scanned: engine.scanned,
        instantiated: engine.instantiated.len(),
        pending_edges: engine.pending.len(),
        retraction,
    };
    Ok(Analysis {
        graph,
        instantiated: engine.instantiated,
        stats,
    })
}

struct Engine<'a> {
    graph: ClassGraph,
    options: &'a AnalysisOptions,
    instantiated: InstantiationSet,
    pending: PendingEdges,
    worklist: VecDeque<MethodId>,
    scanned: usize,
}

impl Engine<'_> {
    fn seed(&mut self) -> Result<(), ShakeError> {
        let options = self.options;
        let root_name = options.root.as_str();
        let root = self
            .graph
            .lookup(root_name)
            .filter(|id| self.graph.class(*id).is_local())
            .ok_or_else(|| ShakeError::MissingRootClass(root_name.replace('/', ".")))?;
        let entry = self
            .graph
            .find_method(root, "main", ENTRY_DESCRIPTOR)
            .or_else(|| {
                self.graph
                    .class(root)
                    .methods
                    .iter()
                    .find(|((name, _), _)| name == "main")
                    .map(|(_, id)| *id)
            })
            .ok_or_else(|| ShakeError::RootHasNoEntryMethod(root_name.replace('/', ".")))?;
        debug!(entry = %describe(&self.graph, entry), "entry point");
        self.mark_class_used(root, Support::Pin(Pin::EntryPoint));
        self.pin_method(entry, Pin::EntryPoint);

        for name in &options.keep {
            let Some(id) = self.local_class(name) else {
                warn!(class = %name, "keep-listed class not found in input");
                continue;
            };
            self.graph.class_mut(id).is_keep_listed = true;
            self.mark_class_used(id, Support::Pin(Pin::KeepListed));
            self.pin_own_methods(id, Pin::KeepListed);
            self.instantiate(id);
        }

        for registration in &options.providers {
            for name in &registration.providers {
                let Some(id) = self.local_class(name) else {
                    debug!(service = %registration.service, provider = %name, "provider not in input");
                    continue;
                };
                self.graph.class_mut(id).is_service_provider = true;
                self.mark_class_used(id, Support::Pin(Pin::ServiceProvider));
                self.pin_own_methods(id, Pin::ServiceProvider);
                self.pin_inherited_methods(id, Pin::ServiceProvider);
                self.instantiate(id);
            }
        }
        Ok(())
    }

    fn run(&mut self) {
        while let Some(method) = self.worklist.pop_front() {
            self.scan_method(method);
        }
    }

    fn local_class(&self, name: &str) -> Option<ClassId> {
        self.graph
            .lookup(name)
            .filter(|id| self.graph.class(*id).is_local())
    }

    /// Mark `class` used, then its supertypes and class-level dependencies. A class
    /// becoming used pins its static initializer.
    fn mark_class_used(&mut self, class: ClassId, support: Support) {
        let mut queue = VecDeque::from([(class, support)]);
        while let Some((id, support)) = queue.pop_front() {
            let node = self.graph.class_mut(id);
            match support {
                Support::Pin(pin) => {
                    node.pin.get_or_insert(pin);
                }
                Support::Method(method) => {
                    node.users.insert(method);
                }
                Support::Class(dependent) => {
                    node.dependents.insert(dependent);
                }
            }
            if node.used {
                continue;
            }
            node.used = true;
            let required: Vec<ClassId> = node
                .super_node
                .into_iter()
                .chain(node.interface_nodes.iter().copied())
                .chain(node.dependencies.iter().copied())
                .collect();
            queue.extend(required.into_iter().map(|required| (required, Support::Class(id))));

            if let Some(initializer) = self.graph.find_method(id, "<clinit>", "()V") {
                self.pin_method(initializer, Pin::ClassInit);
            }
            if self.options.dispatch == DispatchMode::Cha {
                self.apply_library_callbacks(id);
            }
        }
    }

    fn pin_method(&mut self, method: MethodId, pin: Pin) {
        self.graph.method_mut(method).pin.get_or_insert(pin);
        self.mark_method_used(method);
    }

    fn pin_own_methods(&mut self, class: ClassId, pin: Pin) {
        let methods: Vec<MethodId> = self.graph.class(class).methods.values().copied().collect();
        for method in methods {
            self.pin_method(method, pin);
        }
    }

    /// Pin methods declared by Local ancestors that `class` dispatches to without
    /// overriding them.
    fn pin_inherited_methods(&mut self, class: ClassId, pin: Pin) {
        let mut inherited = Vec::new();
        for ancestor in self.graph.ancestors(class).into_iter().skip(1) {
            let node = self.graph.class(ancestor);
            if !node.is_local() {
                continue;
            }
            for ((name, descriptor), id) in &node.methods {
                if self.graph.method(*id).is_overridable()
                    && self.graph.resolve_virtual(class, name, descriptor) == Some(*id)
                {
                    inherited.push(*id);
                }
            }
        }
        for method in inherited {
            self.pin_method(method, pin);
        }
    }

    fn mark_method_used(&mut self, method: MethodId) {
        let node = self.graph.method_mut(method);
        if node.used {
            return;
        }
        node.used = true;
        let owner = node.owner;
        let has_source = node.source.is_some();
        if node.name != "<clinit>" {
            self.mark_class_used(owner, Support::Method(method));
        }
        if has_source {
            self.worklist.push_back(method);
        }
    }

    fn add_edge(&mut self, caller: MethodId, callee: MethodId, virtual_edge: bool) {
        let node = self.graph.method_mut(caller);
        if virtual_edge {
            node.virtual_callees.insert(callee);
        } else {
            node.static_callees.insert(callee);
        }
        self.graph.method_mut(callee).callers.insert(caller);
        self.mark_method_used(callee);
    }

    fn scan_method(&mut self, id: MethodId) {
        let Some(source) = self.graph.method_mut(id).source.take() else {
            return;
        };
        self.graph.method_mut(id).scanned = true;
        self.scanned += 1;
        let owner = self.graph.method(id).owner;

        let mut dependencies = Dependencies::new();
        dependencies.add_method_descriptor(&source.descriptor);
        if let Some(signature) = &source.signature {
            dependencies.add_signature(signature);
        }
        for exception in &source.exceptions {
            dependencies.add_internal_name(exception);
        }
        dependencies.add_annotations(&source.annotations);

        let mut allocations = Vec::new();
        let mut reflective = Vec::new();
        if let Some(body) = &source.body {
            for catch_type in &body.catch_types {
                dependencies.add_internal_name(catch_type);
            }
            for signature in &body.local_signatures {
                dependencies.add_signature(signature);
            }
            for instruction in &body.instructions {
                match &instruction.kind {
                    InstructionKind::Invoke(call) => {
                        dependencies.add_internal_name(&call.owner);
                        dependencies.add_method_descriptor(&call.descriptor);
                    }
                    InstructionKind::InvokeDynamic(site) => {
                        dependencies.add_method_descriptor(&site.descriptor);
                        dependencies.add_method_handle(&site.bootstrap);
                        for argument in &site.arguments {
                            dependencies.add_constant(argument);
                        }
                    }
                    InstructionKind::FieldAccess(field) => {
                        dependencies.add_internal_name(&field.owner);
                        dependencies.add_descriptor(&field.descriptor);
                    }
                    InstructionKind::Type(op, name) => {
                        dependencies.add_internal_name(name);
                        if *op == TypeOp::New {
                            allocations.push(name.as_str());
                        }
                    }
                    InstructionKind::MultiNewArray(name) => dependencies.add_internal_name(name),
                    InstructionKind::Constant(Constant::String(value)) if self.options.reflection_strings => {
                        reflective.extend(reflective_class_name(value));
                    }
                    InstructionKind::Constant(constant) => dependencies.add_constant(constant),
                    InstructionKind::Other(_) => {}
                }
            }
        }

        let resolved: Vec<ClassId> = dependencies
            .names()
            .filter_map(|name| self.graph.lookup(name))
            .filter(|dependency| *dependency != owner)
            .collect();
        for dependency in resolved {
            self.graph.method_mut(id).dependent_classes.insert(dependency);
            self.mark_class_used(dependency, Support::Method(id));
        }

        for name in allocations {
            if let Some(class) = self.graph.lookup(name) {
                self.instantiate(class);
            }
        }
        for name in reflective {
            self.load_reflectively(&name);
        }

        let Some(body) = &source.body else {
            return;
        };
        for instruction in &body.instructions {
            match &instruction.kind {
                InstructionKind::Invoke(call) => {
                    self.handle_call(id, &call.owner, &call.name, &call.descriptor, call.kind);
                }
                InstructionKind::InvokeDynamic(site) => {
                    self.handle_method_handle(id, &site.bootstrap);
                    for argument in &site.arguments {
                        if let Constant::MethodHandle(handle) = argument {
                            self.handle_method_handle(id, handle);
                        }
                    }
                }
                InstructionKind::Constant(Constant::MethodHandle(handle)) => {
                    self.handle_method_handle(id, handle);
                }
                _ => {}
            }
        }
    }

    /// A string naming a class: keep the class and its constructors, and treat a
    /// concrete class as instantiated.
    fn load_reflectively(&mut self, name: &str) {
        let Some(class) = self.local_class(name) else {
            return;
        };
        debug!(class = %name, "reflective load");
        self.mark_class_used(class, Support::Pin(Pin::Reflective));
        let constructors: Vec<MethodId> = self
            .graph
            .class(class)
            .methods
            .iter()
            .filter(|((method_name, _), _)| method_name == "<init>")
            .map(|(_, id)| *id)
            .collect();
        for constructor in constructors {
            self.pin_method(constructor, Pin::Reflective);
        }
        if !self.graph.class(class).is_abstract_type() {
            self.instantiate(class);
        }
    }

    fn handle_method_handle(&mut self, caller: MethodId, handle: &MethodHandle) {
        let Some(kind) = handle.kind.call_kind() else {
            return;
        };
        if handle.kind == HandleKind::NewInvokeSpecial {
            if let Some(class) = self.graph.lookup(&handle.owner) {
                self.instantiate(class);
            }
        }
        self.handle_call(caller, &handle.owner, &handle.name, &handle.descriptor, kind);
    }

    fn handle_call(&mut self, caller: MethodId, owner: &str, name: &str, descriptor: &str, kind: CallKind) {
        let Some(receiver) = self.graph.lookup(owner) else {
            return;
        };
        let Some(declared) = self.graph.declared_definition(receiver, name, descriptor) else {
            debug!(owner, name, descriptor, "no declaration found for call");
            return;
        };
        self.add_edge(caller, declared, false);
        if !kind.is_dynamic_dispatch() || !self.graph.method(declared).is_overridable() {
            return;
        }

        // A subtype may inherit its implementation from a class outside the subtree.
        let mut targets = FxHashSet::default();
        for class in self.graph.subtree(receiver) {
            let Some(target) = self.graph.resolve_virtual(class, name, descriptor) else {
                continue;
            };
            let method = self.graph.method(target);
            if target == declared
                || !method.is_overridable()
                || method.access.is_abstract()
                || !targets.insert(target)
            {
                continue;
            }
            let owner = method.owner;
            if !self.options.dispatch.gates_dispatch() || self.dispatches_to(receiver, target) {
                self.add_edge(caller, target, true);
            } else {
                debug!(target = %describe(&self.graph, target), "dispatch pending");
                self.pending.insert(
                    owner,
                    PendingEdge {
                        caller,
                        target,
                        receiver,
                    },
                );
            }
        }
    }

    /// True when an instantiated subtype of `receiver` selects `target`.
    fn dispatches_to(&self, receiver: ClassId, target: MethodId) -> bool {
        let method = self.graph.method(target);
        self.graph.subtree(method.owner).into_iter().any(|class| {
            self.instantiated.contains(class)
                && self.graph.is_subtype(class, receiver)
                && self.graph.resolve_virtual(class, &method.name, &method.descriptor) == Some(target)
        })
    }

    fn instantiate(&mut self, class: ClassId) {
        if !self.instantiated.insert(class) {
            return;
        }
        debug!(class = %self.graph.class(class).name, "instantiated");
        if !self.options.dispatch.gates_dispatch() {
            if self.options.dispatch == DispatchMode::ChaPrune {
                self.apply_library_callbacks(class);
            }
            return;
        }

        let mut confirmed = Vec::new();
        for ancestor in self.graph.ancestors(class) {
            let graph = &self.graph;
            confirmed.extend(self.pending.take_ready(ancestor, |edge| {
                let target = graph.method(edge.target);
                graph.is_subtype(class, edge.receiver)
                    && graph.resolve_virtual(class, &target.name, &target.descriptor) == Some(edge.target)
            }));
        }
        for edge in confirmed {
            debug!(target = %describe(&self.graph, edge.target), "dispatch confirmed");
            self.add_edge(edge.caller, edge.target, true);
        }
        self.apply_library_callbacks(class);
    }

    /// Library code may call back into overrides of library methods on an instance
    /// of `class`. Pin every such override `class` dispatches to. An ancestor whose
    /// members are unknown could declare anything, so it pins every overridable method.
    fn apply_library_callbacks(&mut self, class: ClassId) {
        if !self.graph.class(class).is_local() {
            return;
        }
        let ancestors = self.graph.ancestors(class);
        let external: Vec<ClassId> = ancestors
            .iter()
            .copied()
            .filter(|ancestor| !self.graph.class(*ancestor).is_local())
            .collect();
        let opaque = external
            .iter()
            .any(|ancestor| !self.graph.class(*ancestor).members_known);

        let mut callbacks = Vec::new();
        for ancestor in ancestors {
            let node = self.graph.class(ancestor);
            if !node.is_local() {
                continue;
            }
            for ((name, descriptor), id) in &node.methods {
                let method = self.graph.method(*id);
                if !method.is_overridable() || method.access.is_abstract() {
                    continue;
                }
                let overrides_library = opaque
                    || external.iter().any(|library| {
                        self.graph
                            .find_method(*library, name, descriptor)
                            .is_some_and(|declared| self.graph.method(declared).is_overridable())
                    });
                if overrides_library && self.graph.resolve_virtual(class, name, descriptor) == Some(*id) {
                    callbacks.push(*id);
                }
            }
        }
        for method in callbacks {
            if !self.graph.method(method).used {
                debug!(method = %describe(&self.graph, method), "library callback");
            }
            self.pin_method(method, Pin::LibraryCallback);
        }
    }
}
