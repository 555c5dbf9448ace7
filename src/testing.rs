//! Hand assembly of class files and JARs for unit tests.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use zip::write::SimpleFileOptions;

pub(crate) struct ClassBuilder {
    pool: Vec<Vec<u8>>,
    interned: HashMap<Vec<u8>, u16>,
    access_flags: u16,
    this_class: u16,
    super_class: u16,
    interfaces: Vec<u16>,
    fields: Vec<Vec<u8>>,
    methods: Vec<Vec<u8>>,
    bootstrap_methods: Vec<(u16, Vec<u16>)>,
    attributes: Vec<Vec<u8>>,
}

impl ClassBuilder {
    pub(crate) fn new(name: &str, super_name: Option<&str>) -> Self {
        let mut builder = Self {
            pool: Vec::new(),
            interned: HashMap::new(),
            access_flags: 0x0021,
            this_class: 0,
            super_class: 0,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            bootstrap_methods: Vec::new(),
            attributes: Vec::new(),
        };
        builder.this_class = builder.class(name);
        if let Some(super_name) = super_name {
            builder.super_class = builder.class(super_name);
        }
        builder
    }

    pub(crate) fn interface(&mut self, name: &str) {
        let index = self.class(name);
        self.interfaces.push(index);
    }

    pub(crate) fn utf8(&mut self, value: &str) -> u16 {
        let mut entry = vec![1];
        entry.extend_from_slice(&(value.len() as u16).to_be_bytes());
        entry.extend_from_slice(value.as_bytes());
        self.intern(entry)
    }

    pub(crate) fn class(&mut self, name: &str) -> u16 {
        let name_index = self.utf8(name);
        self.entry_u16(7, name_index)
    }

    pub(crate) fn string(&mut self, value: &str) -> u16 {
        let string_index = self.utf8(value);
        self.entry_u16(8, string_index)
    }

    pub(crate) fn method_type(&mut self, descriptor: &str) -> u16 {
        let descriptor_index = self.utf8(descriptor);
        self.entry_u16(16, descriptor_index)
    }

    pub(crate) fn name_and_type(&mut self, name: &str, descriptor: &str) -> u16 {
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        self.entry_u16_pair(12, name_index, descriptor_index)
    }

    pub(crate) fn field_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> u16 {
        self.member_ref(9, owner, name, descriptor)
    }

    pub(crate) fn method_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> u16 {
        self.member_ref(10, owner, name, descriptor)
    }

    pub(crate) fn method_handle(&mut self, kind: u8, reference_index: u16) -> u16 {
        let mut entry = vec![15, kind];
        entry.extend_from_slice(&reference_index.to_be_bytes());
        self.intern(entry)
    }

    /// Register a bootstrap method and return its index in the BootstrapMethods table.
    pub(crate) fn bootstrap_method(&mut self, handle_index: u16, arguments: Vec<u16>) -> u16 {
        self.bootstrap_methods.push((handle_index, arguments));
        (self.bootstrap_methods.len() - 1) as u16
    }

    pub(crate) fn invoke_dynamic(&mut self, bootstrap_index: u16, name: &str, descriptor: &str) -> u16 {
        let name_and_type = self.name_and_type(name, descriptor);
        self.entry_u16_pair(18, bootstrap_index, name_and_type)
    }

    pub(crate) fn field(&mut self, access_flags: u16, name: &str, descriptor: &str) {
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        let mut field = Vec::new();
        field.extend_from_slice(&access_flags.to_be_bytes());
        field.extend_from_slice(&name_index.to_be_bytes());
        field.extend_from_slice(&descriptor_index.to_be_bytes());
        field.extend_from_slice(&0u16.to_be_bytes());
        self.fields.push(field);
    }

    pub(crate) fn method(&mut self, access_flags: u16, name: &str, descriptor: &str, code: Option<Vec<u8>>) {
        let attributes = match code {
            Some(code) => vec![self.code_attribute(&code)],
            None => Vec::new(),
        };
        self.method_with_attributes(access_flags, name, descriptor, attributes);
    }

    pub(crate) fn method_with_attributes(
        &mut self,
        access_flags: u16,
        name: &str,
        descriptor: &str,
        attributes: Vec<Vec<u8>>,
    ) {
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        let mut method = Vec::new();
        method.extend_from_slice(&access_flags.to_be_bytes());
        method.extend_from_slice(&name_index.to_be_bytes());
        method.extend_from_slice(&descriptor_index.to_be_bytes());
        method.extend_from_slice(&(attributes.len() as u16).to_be_bytes());
        for attribute in attributes {
            method.extend_from_slice(&attribute);
        }
        self.methods.push(method);
    }

    pub(crate) fn code_attribute(&mut self, code: &[u8]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&8u16.to_be_bytes());
        payload.extend_from_slice(&8u16.to_be_bytes());
        payload.extend_from_slice(&(code.len() as u32).to_be_bytes());
        payload.extend_from_slice(code);
        payload.extend_from_slice(&0u16.to_be_bytes());
        payload.extend_from_slice(&0u16.to_be_bytes());
        self.attribute("Code", payload)
    }

    pub(crate) fn signature_attribute(&mut self, signature: &str) -> Vec<u8> {
        let index = self.utf8(signature);
        self.attribute("Signature", index.to_be_bytes().to_vec())
    }

    /// RuntimeVisibleAnnotations holding `@annotation(level = enum_type.HIGH, config = literal.class)`.
    pub(crate) fn annotation_attribute(&mut self, annotation: &str, enum_type: &str, literal: &str) -> Vec<u8> {
        let type_index = self.utf8(annotation);
        let level_name = self.utf8("level");
        let enum_type_index = self.utf8(enum_type);
        let enum_constant = self.utf8("HIGH");
        let config_name = self.utf8("config");
        let literal_index = self.utf8(literal);

        let mut payload = Vec::new();
        payload.extend_from_slice(&1u16.to_be_bytes());
        payload.extend_from_slice(&type_index.to_be_bytes());
        payload.extend_from_slice(&2u16.to_be_bytes());
        payload.extend_from_slice(&level_name.to_be_bytes());
        payload.push(b'e');
        payload.extend_from_slice(&enum_type_index.to_be_bytes());
        payload.extend_from_slice(&enum_constant.to_be_bytes());
        payload.extend_from_slice(&config_name.to_be_bytes());
        payload.push(b'c');
        payload.extend_from_slice(&literal_index.to_be_bytes());
        self.attribute("RuntimeVisibleAnnotations", payload)
    }

    pub(crate) fn class_attribute(&mut self, attribute: Vec<u8>) {
        self.attributes.push(attribute);
    }

    pub(crate) fn attribute(&mut self, name: &str, payload: Vec<u8>) -> Vec<u8> {
        let name_index = self.utf8(name);
        let mut attribute = Vec::new();
        attribute.extend_from_slice(&name_index.to_be_bytes());
        attribute.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        attribute.extend_from_slice(&payload);
        attribute
    }

    pub(crate) fn build(mut self) -> Vec<u8> {
        if !self.bootstrap_methods.is_empty() {
            let mut payload = Vec::new();
            payload.extend_from_slice(&(self.bootstrap_methods.len() as u16).to_be_bytes());
            for (handle, arguments) in &self.bootstrap_methods {
                payload.extend_from_slice(&handle.to_be_bytes());
                payload.extend_from_slice(&(arguments.len() as u16).to_be_bytes());
                for argument in arguments {
                    payload.extend_from_slice(&argument.to_be_bytes());
                }
            }
            let attribute = self.attribute("BootstrapMethods", payload);
            self.attributes.push(attribute);
        }

        let mut out = Vec::new();
        out.extend_from_slice(&0xCAFEBABEu32.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&52u16.to_be_bytes());
        out.extend_from_slice(&((self.pool.len() + 1) as u16).to_be_bytes());
        for entry in &self.pool {
            out.extend_from_slice(entry);
        }
        out.extend_from_slice(&self.access_flags.to_be_bytes());
        out.extend_from_slice(&self.this_class.to_be_bytes());
        out.extend_from_slice(&self.super_class.to_be_bytes());
        out.extend_from_slice(&(self.interfaces.len() as u16).to_be_bytes());
        for interface in &self.interfaces {
            out.extend_from_slice(&interface.to_be_bytes());
        }
        for table in [&self.fields, &self.methods, &self.attributes] {
            out.extend_from_slice(&(table.len() as u16).to_be_bytes());
            for item in table {
                out.extend_from_slice(item);
            }
        }
        out
    }

    fn member_ref(&mut self, tag: u8, owner: &str, name: &str, descriptor: &str) -> u16 {
        let class_index = self.class(owner);
        let name_and_type = self.name_and_type(name, descriptor);
        self.entry_u16_pair(tag, class_index, name_and_type)
    }

    fn entry_u16(&mut self, tag: u8, value: u16) -> u16 {
        let mut entry = vec![tag];
        entry.extend_from_slice(&value.to_be_bytes());
        self.intern(entry)
    }

    fn entry_u16_pair(&mut self, tag: u8, first: u16, second: u16) -> u16 {
        let mut entry = vec![tag];
        entry.extend_from_slice(&first.to_be_bytes());
        entry.extend_from_slice(&second.to_be_bytes());
        self.intern(entry)
    }

    fn intern(&mut self, entry: Vec<u8>) -> u16 {
        if let Some(index) = self.interned.get(&entry) {
            return *index;
        }
        self.pool.push(entry.clone());
        let index = self.pool.len() as u16;
        self.interned.insert(entry, index);
        index
    }
}

/// Minimal bytecode assembler.
#[derive(Default)]
pub(crate) struct Asm {
    code: Vec<u8>,
}

impl Asm {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn op(mut self, opcode: u8) -> Self {
        self.code.push(opcode);
        self
    }

    pub(crate) fn op_u16(mut self, opcode: u8, operand: u16) -> Self {
        self.code.push(opcode);
        self.code.extend_from_slice(&operand.to_be_bytes());
        self
    }

    pub(crate) fn invokedynamic(mut self, index: u16) -> Self {
        self.code.push(crate::opcodes::INVOKEDYNAMIC);
        self.code.extend_from_slice(&index.to_be_bytes());
        self.code.extend_from_slice(&[0, 0]);
        self
    }

    pub(crate) fn build(self) -> Vec<u8> {
        self.code
    }
}

pub(crate) const ALOAD_0: u8 = 0x2a;
pub(crate) const DUP: u8 = 0x59;
pub(crate) const POP: u8 = 0x57;
pub(crate) const RETURN: u8 = 0xb1;

/// `aload_0; invokespecial super.<init>()V; return`
pub(crate) fn constructor(builder: &mut ClassBuilder, super_name: &str) {
    let super_init = builder.method_ref(super_name, "<init>", "()V");
    let code = Asm::new()
        .op(ALOAD_0)
        .op_u16(crate::opcodes::INVOKESPECIAL, super_init)
        .op(RETURN)
        .build();
    builder.method(0x0001, "<init>", "()V", Some(code));
}

/// Write a JAR with the given entries in order. Names ending in `/` become directories.
pub(crate) fn write_jar(path: &Path, entries: &[(&str, Vec<u8>)]) {
    let file = fs::File::create(path).expect("create jar");
    let mut writer = zip::ZipWriter::new(file);
    for (name, data) in entries {
        if name.ends_with('/') {
            writer
                .add_directory(*name, SimpleFileOptions::default())
                .expect("add directory");
        } else {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .expect("start entry");
            writer.write_all(data).expect("write entry");
        }
    }
    writer.finish().expect("finish jar");
}

/// Hand-built IR for graph and engine tests.
pub(crate) mod ir {
    use crate::ir::{
        CallKind, CallSite, Class, Constant, DynamicCallSite, Instruction, InstructionKind, Method,
        MethodAccess, MethodBody, MethodHandle, TypeOp,
    };

    pub(crate) const PUBLIC: u16 = 0x0001;
    pub(crate) const PUBLIC_STATIC: u16 = 0x0009;
    pub(crate) const PUBLIC_ABSTRACT: u16 = 0x0401;

    pub(crate) fn class(name: &str, super_name: Option<&str>, interfaces: &[&str], methods: Vec<Method>) -> Class {
        Class {
            name: name.to_string(),
            access_flags: 0x0021,
            super_name: super_name.map(str::to_string),
            interfaces: interfaces.iter().map(|name| name.to_string()).collect(),
            signature: None,
            outer_class: None,
            outer_method_descriptor: None,
            annotations: Vec::new(),
            fields: Vec::new(),
            methods,
        }
    }

    pub(crate) fn interface(name: &str, methods: Vec<Method>) -> Class {
        let mut class = class(name, Some("java/lang/Object"), &[], methods);
        class.access_flags = 0x0601;
        class
    }

    pub(crate) fn method(flags: u16, name: &str, descriptor: &str, instructions: Vec<InstructionKind>) -> Method {
        let access = MethodAccess::new(flags);
        let body = if access.is_abstract() {
            None
        } else {
            Some(MethodBody {
                instructions: instructions
                    .into_iter()
                    .enumerate()
                    .map(|(offset, kind)| Instruction {
                        offset: offset as u32,
                        kind,
                    })
                    .collect(),
                catch_types: Vec::new(),
                local_signatures: Vec::new(),
            })
        };
        Method {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            access,
            signature: None,
            exceptions: Vec::new(),
            annotations: Vec::new(),
            body,
        }
    }

    /// Public no-arg constructor calling the superclass constructor.
    pub(crate) fn init(super_name: &str) -> Method {
        method(PUBLIC, "<init>", "()V", vec![call(CallKind::Special, super_name, "<init>", "()V")])
    }

    pub(crate) fn main(instructions: Vec<InstructionKind>) -> Method {
        method(PUBLIC_STATIC, "main", "([Ljava/lang/String;)V", instructions)
    }

    pub(crate) fn call(kind: CallKind, owner: &str, name: &str, descriptor: &str) -> InstructionKind {
        InstructionKind::Invoke(CallSite {
            owner: owner.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            kind,
            offset: 0,
        })
    }

    /// `new owner; dup; invokespecial owner.<init>()V`
    pub(crate) fn construct(owner: &str) -> Vec<InstructionKind> {
        vec![
            InstructionKind::Type(TypeOp::New, owner.to_string()),
            InstructionKind::Other(0x59),
            call(CallKind::Special, owner, "<init>", "()V"),
        ]
    }

    pub(crate) fn string(value: &str) -> InstructionKind {
        InstructionKind::Constant(Constant::String(value.to_string()))
    }

    pub(crate) fn lambda(bootstrap: MethodHandle, target: MethodHandle) -> InstructionKind {
        InstructionKind::InvokeDynamic(DynamicCallSite {
            name: "run".to_string(),
            descriptor: "()Ljava/lang/Runnable;".to_string(),
            bootstrap,
            arguments: vec![
                Constant::MethodType("()V".to_string()),
                Constant::MethodHandle(target),
                Constant::MethodType("()V".to_string()),
            ],
        })
    }
}

/// Application with an inherited call (`Main -> Foo.bar`, declared on `Base`) and
/// an unreferenced `Unused` class, laid out as JAR entries.
pub(crate) fn sample_app_entries() -> Vec<(&'static str, Vec<u8>)> {
    let mut base = ClassBuilder::new("app/Base", Some("java/lang/Object"));
    constructor(&mut base, "java/lang/Object");
    base.method(0x0001, "bar", "()V", Some(Asm::new().op(RETURN).build()));
    base.method(0x0001, "unusedHelper", "()V", Some(Asm::new().op(RETURN).build()));

    let mut foo = ClassBuilder::new("app/Foo", Some("app/Base"));
    constructor(&mut foo, "app/Base");

    let mut main = ClassBuilder::new("app/Main", Some("java/lang/Object"));
    constructor(&mut main, "java/lang/Object");
    let foo_class = main.class("app/Foo");
    let foo_init = main.method_ref("app/Foo", "<init>", "()V");
    let foo_bar = main.method_ref("app/Foo", "bar", "()V");
    let code = Asm::new()
        .op_u16(crate::opcodes::NEW, foo_class)
        .op(DUP)
        .op_u16(crate::opcodes::INVOKESPECIAL, foo_init)
        .op_u16(crate::opcodes::INVOKEVIRTUAL, foo_bar)
        .op(RETURN)
        .build();
    main.method(0x0009, "main", "([Ljava/lang/String;)V", Some(code));

    let mut unused = ClassBuilder::new("app/Unused", Some("java/lang/Object"));
    constructor(&mut unused, "java/lang/Object");
    unused.method(0x0001, "baz", "()V", Some(Asm::new().op(RETURN).build()));

    vec![
        ("META-INF/", Vec::new()),
        ("META-INF/MANIFEST.MF", b"Manifest-Version: 1.0\nMain-Class: app.Main\n".to_vec()),
        ("META-INF/APP.SF", b"Signature-Version: 1.0\n".to_vec()),
        ("app/", Vec::new()),
        ("app/Base.class", base.build()),
        ("app/Foo.class", foo.build()),
        ("app/Main.class", main.build()),
        ("app/Unused.class", unused.build()),
        ("app/messages.properties", b"greeting=hello\n".to_vec()),
    ]
}
