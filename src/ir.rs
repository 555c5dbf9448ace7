#![allow(dead_code)]

pub(crate) const ACC_PUBLIC: u16 = 0x0001;
pub(crate) const ACC_PRIVATE: u16 = 0x0002;
pub(crate) const ACC_STATIC: u16 = 0x0008;
pub(crate) const ACC_INTERFACE: u16 = 0x0200;
pub(crate) const ACC_ABSTRACT: u16 = 0x0400;

/// Intermediate representation for parsed JVM classes and methods.
#[derive(Clone, Debug)]
pub(crate) struct Class {
    pub(crate) name: String,
    pub(crate) access_flags: u16,
    pub(crate) super_name: Option<String>,
    pub(crate) interfaces: Vec<String>,
    pub(crate) signature: Option<String>,
    /// Class named by the EnclosingMethod attribute, with the enclosing method descriptor if any.
    pub(crate) outer_class: Option<String>,
    pub(crate) outer_method_descriptor: Option<String>,
    /// Descriptors collected from annotation payloads (annotation types, enum types, class literals).
    pub(crate) annotations: Vec<String>,
    pub(crate) fields: Vec<Field>,
    pub(crate) methods: Vec<Method>,
}

#[derive(Clone, Debug)]
pub(crate) struct Field {
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) signature: Option<String>,
    pub(crate) annotations: Vec<String>,
}

/// Intermediate representation for a method and its bytecode.
#[derive(Clone, Debug)]
pub(crate) struct Method {
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) access: MethodAccess,
    pub(crate) signature: Option<String>,
    pub(crate) exceptions: Vec<String>,
    pub(crate) annotations: Vec<String>,
    /// `None` for abstract and native methods.
    pub(crate) body: Option<MethodBody>,
}

/// Method access flags used for dispatch decisions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct MethodAccess {
    pub(crate) flags: u16,
}

impl MethodAccess {
    pub(crate) fn new(flags: u16) -> Self {
        Self { flags }
    }

    pub(crate) fn is_private(self) -> bool {
        self.flags & ACC_PRIVATE != 0
    }

    pub(crate) fn is_static(self) -> bool {
        self.flags & ACC_STATIC != 0
    }

    pub(crate) fn is_abstract(self) -> bool {
        self.flags & ACC_ABSTRACT != 0
    }
}

/// Decoded Code attribute content relevant to reachability.
#[derive(Clone, Debug, Default)]
pub(crate) struct MethodBody {
    pub(crate) instructions: Vec<Instruction>,
    pub(crate) catch_types: Vec<String>,
    /// Generic signatures from the LocalVariableTypeTable.
    pub(crate) local_signatures: Vec<String>,
}

/// Bytecode instruction captured for analysis.
#[derive(Clone, Debug)]
pub(crate) struct Instruction {
    pub(crate) offset: u32,
    pub(crate) kind: InstructionKind,
}

/// Instruction kinds needed for call graph construction.
#[derive(Clone, Debug)]
pub(crate) enum InstructionKind {
    Invoke(CallSite),
    InvokeDynamic(DynamicCallSite),
    FieldAccess(FieldRef),
    Type(TypeOp, String),
    MultiNewArray(String),
    Constant(Constant),
    Other(u8),
}

/// Instructions that name a class operand.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum TypeOp {
    New,
    NewArray,
    CheckCast,
    InstanceOf,
}

/// Call site extracted from bytecode.
#[derive(Clone, Debug)]
pub(crate) struct CallSite {
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) kind: CallKind,
    pub(crate) offset: u32,
}

/// Call opcode classification used by CHA.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) enum CallKind {
    Virtual,
    Interface,
    Special,
    Static,
}

impl CallKind {
    pub(crate) fn is_dynamic_dispatch(self) -> bool {
        matches!(self, CallKind::Virtual | CallKind::Interface)
    }
}

/// invokedynamic site with its resolved bootstrap method and static arguments.
#[derive(Clone, Debug)]
pub(crate) struct DynamicCallSite {
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) bootstrap: MethodHandle,
    pub(crate) arguments: Vec<Constant>,
}

#[derive(Clone, Debug)]
pub(crate) struct FieldRef {
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
}

/// Loadable constant as seen by ldc or as a bootstrap argument.
#[derive(Clone, Debug)]
pub(crate) enum Constant {
    String(String),
    /// Internal class name, or an array descriptor.
    Class(String),
    MethodType(String),
    MethodHandle(MethodHandle),
    Other,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct MethodHandle {
    pub(crate) kind: HandleKind,
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
}

/// CONSTANT_MethodHandle reference kinds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum HandleKind {
    GetField,
    GetStatic,
    PutField,
    PutStatic,
    InvokeVirtual,
    InvokeStatic,
    InvokeSpecial,
    NewInvokeSpecial,
    InvokeInterface,
}

impl HandleKind {
    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        let kind = match tag {
            1 => HandleKind::GetField,
            2 => HandleKind::GetStatic,
            3 => HandleKind::PutField,
            4 => HandleKind::PutStatic,
            5 => HandleKind::InvokeVirtual,
            6 => HandleKind::InvokeStatic,
            7 => HandleKind::InvokeSpecial,
            8 => HandleKind::NewInvokeSpecial,
            9 => HandleKind::InvokeInterface,
            _ => return None,
        };
        Some(kind)
    }

    /// Call kind implied by the handle, `None` for field handles.
    pub(crate) fn call_kind(self) -> Option<CallKind> {
        match self {
            HandleKind::InvokeVirtual => Some(CallKind::Virtual),
            HandleKind::InvokeInterface => Some(CallKind::Interface),
            HandleKind::InvokeStatic => Some(CallKind::Static),
            HandleKind::InvokeSpecial | HandleKind::NewInvokeSpecial => Some(CallKind::Special),
            _ => None,
        }
    }
}
