use std::collections::{BTreeSet, VecDeque};

use indexmap::{Equivalent, IndexMap};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::descriptor::Dependencies;
use crate::ir::{self, MethodAccess};

pub(crate) const OBJECT: &str = "java/lang/Object";

/// Overridable members `java/lang/Object` is assumed to declare when no classpath
/// provides its header.
const OBJECT_METHODS: [(&str, &str, u16); 5] = [
    ("equals", "(Ljava/lang/Object;)Z", ir::ACC_PUBLIC),
    ("hashCode", "()I", ir::ACC_PUBLIC),
    ("toString", "()Ljava/lang/String;", ir::ACC_PUBLIC),
    ("clone", "()Ljava/lang/Object;", 0x0004),
    ("finalize", "()V", 0x0004),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct ClassId(u32);

impl ClassId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct MethodId(u32);

impl MethodId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Method name and descriptor.
pub(crate) type MethodKey = (String, String);

/// Borrowed `MethodKey`; hashes the same way as the owned tuple.
#[derive(Clone, Copy, Debug, Hash)]
pub(crate) struct MethodRef<'a>(pub(crate) &'a str, pub(crate) &'a str);

impl Equivalent<MethodKey> for MethodRef<'_> {
    fn equivalent(&self, key: &MethodKey) -> bool {
        self.0 == key.0 && self.1 == key.1
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ClassKind {
    /// Decoded from the input archive; subject to pruning.
    Local,
    /// Classpath library or opaque placeholder; never emitted.
    External,
}

/// Reason a node stays used without incoming edges.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Pin {
    EntryPoint,
    KeepListed,
    ServiceProvider,
    Reflective,
    ClassInit,
    LibraryCallback,
}

#[derive(Debug)]
pub(crate) struct ClassNode {
    pub(crate) name: String,
    pub(crate) kind: ClassKind,
    pub(crate) access_flags: u16,
    pub(crate) super_name: Option<String>,
    pub(crate) interface_names: Vec<String>,
    pub(crate) methods: IndexMap<MethodKey, MethodId>,
    /// False for placeholders created for names nothing declared.
    pub(crate) members_known: bool,
    pub(crate) super_node: Option<ClassId>,
    /// Direct subclasses and implementors.
    pub(crate) child_nodes: Vec<ClassId>,
    pub(crate) interface_nodes: Vec<ClassId>,
    pub(crate) visited: bool,
    pub(crate) used: bool,
    pub(crate) is_service_provider: bool,
    pub(crate) is_keep_listed: bool,
    /// Class-level references (fields, signature, annotations, outer class) by name.
    pub(crate) dependency_names: BTreeSet<String>,
    pub(crate) dependencies: BTreeSet<ClassId>,
    pub(crate) users: BTreeSet<MethodId>,
    pub(crate) dependents: BTreeSet<ClassId>,
    pub(crate) pin: Option<Pin>,
}

impl ClassNode {
    fn new(name: String, kind: ClassKind) -> Self {
        Self {
            name,
            kind,
            access_flags: 0,
            super_name: None,
            interface_names: Vec::new(),
            methods: IndexMap::new(),
            members_known: false,
            super_node: None,
            child_nodes: Vec::new(),
            interface_nodes: Vec::new(),
            visited: false,
            used: false,
            is_service_provider: false,
            is_keep_listed: false,
            dependency_names: BTreeSet::new(),
            dependencies: BTreeSet::new(),
            users: BTreeSet::new(),
            dependents: BTreeSet::new(),
            pin: None,
        }
    }

    pub(crate) fn is_local(&self) -> bool {
        self.kind == ClassKind::Local
    }

    /// Interfaces and abstract classes have no instances of their own.
    pub(crate) fn is_abstract_type(&self) -> bool {
        self.access_flags & (ir::ACC_INTERFACE | ir::ACC_ABSTRACT) != 0
    }
}

#[derive(Debug)]
pub(crate) struct MethodNode {
    pub(crate) owner: ClassId,
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) access: MethodAccess,
    pub(crate) visited: bool,
    pub(crate) used: bool,
    pub(crate) scanned: bool,
    pub(crate) callers: BTreeSet<MethodId>,
    pub(crate) static_callees: BTreeSet<MethodId>,
    pub(crate) virtual_callees: BTreeSet<MethodId>,
    pub(crate) dependent_classes: BTreeSet<ClassId>,
    pub(crate) pin: Option<Pin>,
    /// Decoded body, taken when the method is scanned.
    pub(crate) source: Option<ir::Method>,
}

impl MethodNode {
    pub(crate) fn is_initializer(&self) -> bool {
        self.name.starts_with('<')
    }

    /// Instance method that a subclass may override.
    pub(crate) fn is_overridable(&self) -> bool {
        !self.access.is_static() && !self.access.is_private() && !self.is_initializer()
    }
}

/// Arena of classes and methods with hierarchy links. Nodes are never removed;
/// analysis state lives in their flags and edge sets.
#[derive(Debug, Default)]
pub(crate) struct ClassGraph {
    classes: Vec<ClassNode>,
    methods: Vec<MethodNode>,
    by_name: FxHashMap<String, ClassId>,
}

impl ClassGraph {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add a class decoded from the input archive. A repeated name keeps the first.
    pub(crate) fn register_class(&mut self, class: ir::Class) -> ClassId {
        self.insert_decoded(class, ClassKind::Local, true)
    }

    /// Add a library class header; bodies are dropped since libraries are not scanned.
    pub(crate) fn register_external(&mut self, class: ir::Class) -> ClassId {
        self.insert_decoded(class, ClassKind::External, false)
    }

    fn insert_decoded(&mut self, class: ir::Class, kind: ClassKind, keep_bodies: bool) -> ClassId {
        if let Some(existing) = self.by_name.get(&class.name) {
            debug!(class = %class.name, "duplicate class definition ignored");
            return *existing;
        }
        let dependency_names = class_dependencies(&class);
        let id = self.push_class(ClassNode {
            access_flags: class.access_flags,
            super_name: class.super_name,
            interface_names: class.interfaces,
            members_known: true,
            visited: true,
            dependency_names,
            ..ClassNode::new(class.name, kind)
        });
        for method in class.methods {
            let key = (method.name.clone(), method.descriptor.clone());
            let access = method.access;
            let source = if keep_bodies { Some(method) } else { None };
            self.push_method(id, key, access, true, source);
        }
        id
    }

    /// Existing node for `name`, or a new opaque External placeholder.
    pub(crate) fn resolve(&mut self, name: &str) -> ClassId {
        if let Some(id) = self.by_name.get(name) {
            return *id;
        }
        let id = self.push_class(ClassNode::new(name.to_string(), ClassKind::External));
        if name == OBJECT {
            self.classes[id.index()].members_known = true;
            for (method_name, descriptor, flags) in OBJECT_METHODS {
                let key = (method_name.to_string(), descriptor.to_string());
                self.push_method(id, key, MethodAccess::new(flags), false, None);
            }
        }
        id
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<ClassId> {
        self.by_name.get(name).copied()
    }

    fn push_class(&mut self, node: ClassNode) -> ClassId {
        let id = ClassId(self.classes.len() as u32);
        self.by_name.insert(node.name.clone(), id);
        self.classes.push(node);
        id
    }

    fn push_method(
        &mut self,
        owner: ClassId,
        key: MethodKey,
        access: MethodAccess,
        visited: bool,
        source: Option<ir::Method>,
    ) -> MethodId {
        if let Some(existing) = self.classes[owner.index()].methods.get(&key) {
            return *existing;
        }
        let id = MethodId(self.methods.len() as u32);
        self.methods.push(MethodNode {
            owner,
            name: key.0.clone(),
            descriptor: key.1.clone(),
            access,
            visited,
            used: false,
            scanned: false,
            callers: BTreeSet::new(),
            static_callees: BTreeSet::new(),
            virtual_callees: BTreeSet::new(),
            dependent_classes: BTreeSet::new(),
            pin: None,
            source,
        });
        self.classes[owner.index()].methods.insert(key, id);
        id
    }

    /// Link every node to its supertypes, then fill child lists. Supertypes outside
    /// the analyzed set become placeholders, which are linked in turn.
    pub(crate) fn build_hierarchy(&mut self) {
        let mut index = 0;
        while index < self.classes.len() {
            let id = ClassId(index as u32);
            if let Some(super_name) = self.classes[index].super_name.clone() {
                let super_id = self.resolve(&super_name);
                self.classes[id.index()].super_node = Some(super_id);
            }
            let interface_names = self.classes[index].interface_names.clone();
            let interface_nodes = interface_names
                .iter()
                .map(|name| self.resolve(name))
                .collect();
            self.classes[id.index()].interface_nodes = interface_nodes;
            index += 1;
        }

        for index in 0..self.classes.len() {
            let node = &self.classes[index];
            let dependencies = node
                .dependency_names
                .iter()
                .filter_map(|name| self.by_name.get(name).copied())
                .filter(|dependency| dependency.index() != index)
                .collect();
            self.classes[index].dependencies = dependencies;
            self.classes[index].child_nodes.clear();
        }

        for index in 0..self.classes.len() {
            let id = ClassId(index as u32);
            let parents: Vec<ClassId> = self.classes[index]
                .super_node
                .iter()
                .chain(self.classes[index].interface_nodes.iter())
                .copied()
                .collect();
            for parent in parents {
                self.classes[parent.index()].child_nodes.push(id);
            }
        }
    }

    pub(crate) fn class(&self, id: ClassId) -> &ClassNode {
        &self.classes[id.index()]
    }

    pub(crate) fn class_mut(&mut self, id: ClassId) -> &mut ClassNode {
        &mut self.classes[id.index()]
    }

    pub(crate) fn method(&self, id: MethodId) -> &MethodNode {
        &self.methods[id.index()]
    }

    pub(crate) fn method_mut(&mut self, id: MethodId) -> &mut MethodNode {
        &mut self.methods[id.index()]
    }

    pub(crate) fn class_ids(&self) -> impl Iterator<Item = ClassId> + use<> {
        (0..self.classes.len() as u32).map(ClassId)
    }

    pub(crate) fn method_ids(&self) -> impl Iterator<Item = MethodId> + use<> {
        (0..self.methods.len() as u32).map(MethodId)
    }

    pub(crate) fn find_method(&self, class: ClassId, name: &str, descriptor: &str) -> Option<MethodId> {
        self.class(class).methods.get(&MethodRef(name, descriptor)).copied()
    }

    /// Method the JVM links a call to `class.name descriptor` against: the superclass
    /// chain first, then superinterfaces breadth first.
    pub(crate) fn declared_definition(&self, class: ClassId, name: &str, descriptor: &str) -> Option<MethodId> {
        let chain = self.superclass_chain(class);
        for candidate in &chain {
            if let Some(method) = self.find_method(*candidate, name, descriptor) {
                return Some(method);
            }
        }
        self.interface_closure(&chain)
            .into_iter()
            .find_map(|interface| self.find_method(interface, name, descriptor))
    }

    /// Implementation selected by dynamic dispatch on a receiver of exactly `class`.
    pub(crate) fn resolve_virtual(&self, class: ClassId, name: &str, descriptor: &str) -> Option<MethodId> {
        let chain = self.superclass_chain(class);
        for candidate in &chain {
            if let Some(id) = self.find_method(*candidate, name, descriptor) {
                let method = self.method(id);
                if method.access.is_static() || (method.access.is_private() && *candidate != class) {
                    continue;
                }
                if method.access.is_abstract() {
                    break;
                }
                return Some(id);
            }
        }
        self.interface_closure(&chain).into_iter().find_map(|interface| {
            self.find_method(interface, name, descriptor).filter(|id| {
                let access = self.method(*id).access;
                !access.is_abstract() && !access.is_static() && !access.is_private()
            })
        })
    }

    fn superclass_chain(&self, class: ClassId) -> Vec<ClassId> {
        let mut chain = vec![class];
        let mut current = self.class(class).super_node;
        while let Some(id) = current {
            if chain.contains(&id) {
                break;
            }
            chain.push(id);
            current = self.class(id).super_node;
        }
        chain
    }

    fn interface_closure(&self, chain: &[ClassId]) -> Vec<ClassId> {
        let mut seen = FxHashSet::default();
        let mut order = Vec::new();
        let mut queue: VecDeque<ClassId> = chain
            .iter()
            .flat_map(|id| self.class(*id).interface_nodes.iter().copied())
            .collect();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            order.push(id);
            queue.extend(self.class(id).interface_nodes.iter().copied());
        }
        order
    }

    /// `class` and every transitive subclass or implementor.
    pub(crate) fn subtree(&self, class: ClassId) -> Vec<ClassId> {
        let mut seen = FxHashSet::default();
        let mut order = Vec::new();
        let mut stack = vec![class];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            order.push(id);
            stack.extend(self.class(id).child_nodes.iter().rev().copied());
        }
        order
    }

    /// `class` and every transitive supertype.
    pub(crate) fn ancestors(&self, class: ClassId) -> Vec<ClassId> {
        let mut seen = FxHashSet::default();
        let mut order = Vec::new();
        let mut queue = VecDeque::from([class]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            order.push(id);
            let node = self.class(id);
            queue.extend(node.super_node);
            queue.extend(node.interface_nodes.iter().copied());
        }
        order
    }

    pub(crate) fn is_subtype(&self, sub: ClassId, sup: ClassId) -> bool {
        self.ancestors(sub).contains(&sup)
    }

    pub(crate) fn local_class_count(&self) -> usize {
        self.classes.iter().filter(|class| class.is_local()).count()
    }

    pub(crate) fn visited_class_count(&self) -> usize {
        self.classes.iter().filter(|class| class.is_local() && class.visited).count()
    }

    pub(crate) fn used_class_count(&self) -> usize {
        self.classes.iter().filter(|class| class.is_local() && class.used).count()
    }

    pub(crate) fn local_method_count(&self) -> usize {
        self.methods
            .iter()
            .filter(|method| self.class(method.owner).is_local())
            .count()
    }

    pub(crate) fn used_method_count(&self) -> usize {
        self.methods
            .iter()
            .filter(|method| method.used && self.class(method.owner).is_local())
            .count()
    }
}

/// Names referenced by a class outside its method bodies.
fn class_dependencies(class: &ir::Class) -> BTreeSet<String> {
    let mut dependencies = Dependencies::new();
    if let Some(signature) = &class.signature {
        dependencies.add_signature(signature);
    }
    dependencies.add_annotations(&class.annotations);
    for field in &class.fields {
        dependencies.add_descriptor(&field.descriptor);
        if let Some(signature) = &field.signature {
            dependencies.add_signature(signature);
        }
        dependencies.add_annotations(&field.annotations);
    }
    if let Some(outer) = &class.outer_class {
        dependencies.add_internal_name(outer);
    }
    if let Some(descriptor) = &class.outer_method_descriptor {
        dependencies.add_method_descriptor(descriptor);
    }
    dependencies.remove(&class.name);
    dependencies.into_names()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::CallKind;
    use crate::testing::ir::{PUBLIC, PUBLIC_ABSTRACT, call, class, init, interface, method};

    fn sample_graph() -> ClassGraph {
        let mut graph = ClassGraph::new();
        graph.register_class(interface(
            "app/Greeter",
            vec![
                method(PUBLIC_ABSTRACT, "greet", "()V", vec![]),
                method(PUBLIC, "wave", "()V", vec![]),
            ],
        ));
        graph.register_class(class(
            "app/Base",
            Some("java/lang/Object"),
            &[],
            vec![init("java/lang/Object"), method(PUBLIC, "bar", "()V", vec![])],
        ));
        graph.register_class(class(
            "app/Foo",
            Some("app/Base"),
            &["app/Greeter"],
            vec![
                init("app/Base"),
                method(PUBLIC, "greet", "()V", vec![call(CallKind::Virtual, "app/Foo", "bar", "()V")]),
            ],
        ));
        graph.build_hierarchy();
        graph
    }

    #[test]
    fn build_hierarchy_links_supertypes_and_creates_placeholders() {
        let graph = sample_graph();
        let foo = graph.lookup("app/Foo").expect("foo");
        let base = graph.lookup("app/Base").expect("base");
        let greeter = graph.lookup("app/Greeter").expect("greeter");
        let object = graph.lookup(OBJECT).expect("object placeholder");

        assert_eq!(graph.class(foo).super_node, Some(base));
        assert_eq!(graph.class(foo).interface_nodes, vec![greeter]);
        assert_eq!(graph.class(base).child_nodes, vec![foo]);
        assert_eq!(graph.class(greeter).child_nodes, vec![foo]);
        assert_eq!(graph.class(object).kind, ClassKind::External);
        assert!(graph.class(object).members_known);
        assert!(!graph.class(object).visited);
        assert!(graph.is_subtype(foo, object));
        assert_eq!(graph.local_class_count(), 3);
    }

    #[test]
    fn declared_definition_walks_superclasses_then_interfaces() {
        let graph = sample_graph();
        let foo = graph.lookup("app/Foo").expect("foo");
        let base = graph.lookup("app/Base").expect("base");
        let greeter = graph.lookup("app/Greeter").expect("greeter");

        let bar = graph.declared_definition(foo, "bar", "()V").expect("bar");
        assert_eq!(graph.method(bar).owner, base);
        let wave = graph.declared_definition(foo, "wave", "()V").expect("wave");
        assert_eq!(graph.method(wave).owner, greeter);
        assert!(graph.declared_definition(foo, "missing", "()V").is_none());
    }

    #[test]
    fn resolve_virtual_prefers_class_chain_then_defaults() {
        let graph = sample_graph();
        let foo = graph.lookup("app/Foo").expect("foo");
        let greeter = graph.lookup("app/Greeter").expect("greeter");

        let greet = graph.resolve_virtual(foo, "greet", "()V").expect("greet");
        assert_eq!(graph.method(greet).owner, foo);
        let wave = graph.resolve_virtual(foo, "wave", "()V").expect("default method");
        assert_eq!(graph.method(wave).owner, greeter);
        let to_string = graph
            .resolve_virtual(foo, "toString", "()Ljava/lang/String;")
            .expect("object method");
        assert_eq!(graph.class(graph.method(to_string).owner).name, OBJECT);
        assert!(graph.resolve_virtual(greeter, "greet", "()V").is_none());
    }

    #[test]
    fn find_method_looks_up_by_borrowed_key() {
        let graph = sample_graph();
        let base = graph.lookup("app/Base").expect("base");
        let owned = ("bar".to_string(), "()V".to_string());

        let bar = graph.find_method(base, "bar", "()V").expect("bar");
        assert_eq!(graph.class(base).methods.get(&owned), Some(&bar));
        assert_eq!(graph.method(bar).name, "bar");
        assert!(graph.find_method(base, "bar", "(I)V").is_none());
        assert!(graph.find_method(base, "()V", "bar").is_none());
    }

    #[test]
    fn default_method_resolves_through_superinterface() {
        let mut graph = ClassGraph::new();
        graph.register_class(interface(
            "app/Pinger",
            vec![method(PUBLIC, "ping", "()V", vec![]), method(PUBLIC_ABSTRACT, "pong", "()V", vec![])],
        ));
        let mut extended = interface("app/LoudPinger", vec![]);
        extended.interfaces = vec!["app/Pinger".to_string()];
        graph.register_class(extended);
        graph.register_class(class(
            "app/Echo",
            Some("java/lang/Object"),
            &["app/LoudPinger"],
            vec![init("java/lang/Object"), method(PUBLIC, "pong", "()V", vec![])],
        ));
        graph.build_hierarchy();
        let echo = graph.lookup("app/Echo").expect("echo");
        let pinger = graph.lookup("app/Pinger").expect("pinger");
        let loud = graph.lookup("app/LoudPinger").expect("loud pinger");

        let declared = graph.declared_definition(echo, "ping", "()V").expect("declared ping");
        assert_eq!(graph.method(declared).owner, pinger);
        let selected = graph.resolve_virtual(echo, "ping", "()V").expect("selected ping");
        assert_eq!(selected, declared);
        let pong = graph.declared_definition(loud, "pong", "()V").expect("declared pong");
        assert_eq!(graph.method(pong).owner, pinger);
        assert_eq!(graph.method(graph.resolve_virtual(echo, "pong", "()V").expect("pong")).owner, echo);
        assert!(graph.is_subtype(echo, pinger));
        assert_eq!(graph.subtree(pinger), vec![pinger, loud, echo]);
    }

    #[test]
    fn subtree_covers_implementors() {
        let graph = sample_graph();
        let greeter = graph.lookup("app/Greeter").expect("greeter");
        let foo = graph.lookup("app/Foo").expect("foo");
        let object = graph.lookup(OBJECT).expect("object");

        assert_eq!(graph.subtree(greeter), vec![greeter, foo]);
        assert_eq!(graph.subtree(object).len(), 4);
    }

    #[test]
    fn class_dependencies_cover_fields_and_outer_class() {
        let mut decoded = class("app/Outer$1", Some("java/lang/Object"), &[], vec![]);
        decoded.outer_class = Some("app/Outer".to_string());
        decoded.fields.push(ir::Field {
            name: "items".to_string(),
            descriptor: "Ljava/util/List;".to_string(),
            signature: Some("Ljava/util/List<Lapp/Item;>;".to_string()),
            annotations: vec!["Lapp/Marker;".to_string()],
        });
        let mut graph = ClassGraph::new();
        let id = graph.register_class(decoded);
        graph.register_class(class("app/Outer", Some("java/lang/Object"), &[], vec![]));
        graph.register_class(class("app/Item", Some("java/lang/Object"), &[], vec![]));
        graph.build_hierarchy();

        let names: Vec<_> = graph.class(id).dependency_names.iter().cloned().collect();
        assert_eq!(names, vec!["app/Item", "app/Marker", "app/Outer", "java/util/List"]);
        let resolved: Vec<_> = graph
            .class(id)
            .dependencies
            .iter()
            .map(|dependency| graph.class(*dependency).name.as_str())
            .collect();
        assert_eq!(resolved, vec!["app/Outer", "app/Item"]);
    }
}
