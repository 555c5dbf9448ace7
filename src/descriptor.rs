use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::OnceLock;

use jdescriptor::{MethodDescriptor, TypeDescriptor};
use regex::Regex;

use crate::ir::{Constant, MethodHandle};

/// Class names referenced from descriptors, generic signatures, constants and
/// annotation payloads. Names are collected in internal form; resolving them
/// against the class graph is left to the caller.
#[derive(Clone, Debug, Default)]
pub(crate) struct Dependencies {
    names: BTreeSet<String>,
}

impl Dependencies {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub(crate) fn remove(&mut self, name: &str) {
        self.names.remove(name);
    }

    pub(crate) fn into_names(self) -> BTreeSet<String> {
        self.names
    }

    /// Internal class name as found in CONSTANT_Class; array classes are descriptors.
    pub(crate) fn add_internal_name(&mut self, name: &str) {
        if name.starts_with('[') {
            self.add_descriptor(name);
        } else if !name.is_empty() {
            self.names.insert(name.to_string());
        }
    }

    /// Field descriptor. Arrays contribute their element type.
    pub(crate) fn add_descriptor(&mut self, descriptor: &str) {
        let element = descriptor.trim_start_matches('[');
        if let Some(name) = element.strip_prefix('L').and_then(|rest| rest.strip_suffix(';')) {
            self.names.insert(name.to_string());
        }
    }

    pub(crate) fn add_method_descriptor(&mut self, descriptor: &str) {
        match MethodDescriptor::from_str(descriptor) {
            Ok(parsed) => {
                for parameter in parsed.parameter_types().iter() {
                    self.add_type(parameter);
                }
                self.add_type(parsed.return_type());
            }
            // Descriptor grammar is a subset of the signature grammar.
            Err(_) => self.add_signature(descriptor),
        }
    }

    fn add_type(&mut self, descriptor: &TypeDescriptor) {
        match descriptor {
            TypeDescriptor::Object(name) => {
                self.names.insert(name.to_string());
            }
            TypeDescriptor::Array(element, _) => self.add_type(element),
            _ => {}
        }
    }

    /// Class, method or field generic signature. Malformed input contributes whatever
    /// was read before the error.
    pub(crate) fn add_signature(&mut self, signature: &str) {
        let mut reader = SignatureReader {
            bytes: signature.as_bytes(),
            pos: 0,
            names: &mut self.names,
        };
        let _ = reader.read();
    }

    pub(crate) fn add_method_handle(&mut self, handle: &MethodHandle) {
        self.add_internal_name(&handle.owner);
        if handle.kind.call_kind().is_some() {
            self.add_method_descriptor(&handle.descriptor);
        } else {
            self.add_descriptor(&handle.descriptor);
        }
    }

    /// Type, method-type and method-handle constants. String constants are handled by
    /// the reflective load policy instead.
    pub(crate) fn add_constant(&mut self, constant: &Constant) {
        match constant {
            Constant::Class(name) => self.add_internal_name(name),
            Constant::MethodType(descriptor) => self.add_method_descriptor(descriptor),
            Constant::MethodHandle(handle) => self.add_method_handle(handle),
            Constant::String(_) | Constant::Other => {}
        }
    }

    /// Descriptors collected from annotation payloads.
    pub(crate) fn add_annotations(&mut self, descriptors: &[String]) {
        for descriptor in descriptors {
            self.add_descriptor(descriptor);
        }
    }
}

struct SignatureReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    names: &'a mut BTreeSet<String>,
}

impl SignatureReader<'_> {
    fn read(&mut self) -> Option<()> {
        if self.peek() == Some(b'<') {
            self.type_parameters()?;
        }
        while let Some(byte) = self.peek() {
            match byte {
                b'(' | b')' | b'^' => self.pos += 1,
                _ => self.java_type()?,
            }
        }
        Some(())
    }

    fn type_parameters(&mut self) -> Option<()> {
        self.expect(b'<')?;
        while self.peek()? != b'>' {
            while self.peek()? != b':' {
                self.pos += 1;
            }
            while self.peek() == Some(b':') {
                self.pos += 1;
                if matches!(self.peek()?, b'L' | b'T' | b'[') {
                    self.java_type()?;
                }
            }
        }
        self.expect(b'>')
    }

    fn java_type(&mut self) -> Option<()> {
        match self.peek()? {
            b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' | b'V' | b'*' => {
                self.pos += 1;
                Some(())
            }
            b'+' | b'-' | b'[' => {
                self.pos += 1;
                self.java_type()
            }
            b'T' => {
                while self.peek()? != b';' {
                    self.pos += 1;
                }
                self.expect(b';')
            }
            b'L' => self.class_type(),
            _ => None,
        }
    }

    /// `Lpkg/Outer<args>.Inner<args>;` yields `pkg/Outer` and `pkg/Outer$Inner`.
    fn class_type(&mut self) -> Option<()> {
        self.expect(b'L')?;
        let mut name = String::new();
        loop {
            match self.peek()? {
                b'<' => {
                    self.pos += 1;
                    while self.peek()? != b'>' {
                        self.java_type()?;
                    }
                    self.pos += 1;
                }
                b'.' => {
                    self.names.insert(name.clone());
                    name.push('$');
                    self.pos += 1;
                }
                b';' => {
                    self.pos += 1;
                    self.names.insert(name);
                    return Some(());
                }
                _ => {
                    let start = self.pos;
                    while !matches!(self.peek()?, b'<' | b'.' | b';') {
                        self.pos += 1;
                    }
                    name.push_str(std::str::from_utf8(&self.bytes[start..self.pos]).ok()?);
                }
            }
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn expect(&mut self, byte: u8) -> Option<()> {
        if self.peek()? != byte {
            return None;
        }
        self.pos += 1;
        Some(())
    }
}

fn class_name_shape() -> &'static Regex {
    static SHAPE: OnceLock<Regex> = OnceLock::new();
    SHAPE.get_or_init(|| {
        Regex::new(r"^(?:[a-z][A-Za-z0-9_]*[/.])+[A-Za-z_$][A-Za-z0-9_$]*$")
            .expect("valid class name pattern")
    })
}

/// Internal class name for a string literal that looks like a qualified class name.
pub(crate) fn reflective_class_name(value: &str) -> Option<String> {
    if class_name_shape().is_match(value) {
        Some(internal_name(value))
    } else {
        None
    }
}

/// `a.b.C` to `a/b/C`; internal names pass through unchanged.
pub(crate) fn internal_name(name: &str) -> String {
    name.trim().replace('.', "/")
}
