//! Allow-list of builtin names a submission may reach.
//!
//! Before a program runs, every builtin the runtime provides that is not in
//! its [`CapabilitySet`] is deleted from the builtins module, so a name that
//! is not listed here resolves to `NameError`.

use indexmap::IndexSet;

use crate::error::ConfigError;

/// Builtins available from the first lesson.
const MINIMAL: &[&str] = &[
    "print", "int", "str", "float", "len", "range", "list", "dict", "set", "bool", "abs", "min",
    "max", "sum", "round", "enumerate", "zip",
];

/// Functions and types added by the standard set.
const STANDARD_EXTRAS: &[&str] = &[
    "tuple", "sorted", "reversed", "any", "all", "isinstance", "issubclass", "repr", "chr", "ord",
    "pow", "divmod", "map", "filter", "iter", "next", "format", "hash", "hex", "bin", "oct",
    "callable", "frozenset", "slice", "object", "super", "property", "staticmethod",
    "classmethod", "NotImplemented",
];

const STANDARD_EXCEPTIONS: &[&str] = &[
    "Exception",
    "ArithmeticError",
    "LookupError",
    "ValueError",
    "TypeError",
    "ZeroDivisionError",
    "IndexError",
    "KeyError",
    "NameError",
    "UnboundLocalError",
    "RuntimeError",
    "NotImplementedError",
    "AssertionError",
    "AttributeError",
    "StopIteration",
    "OverflowError",
    "MemoryError",
    "RecursionError",
];

/// Safe builtins that are not in the standard set but may be configured.
const OPTIONAL: &[&str] = &["bytes", "bytearray", "complex", "ascii", "id"];

/// Names the runtime looks up in the builtins module on its own. They stay
/// bound whatever the capability set says.
pub const RUNTIME_NAMES: &[&str] = &["__build_class__", "__name__", "__doc__", "__debug__"];

/// Immutable once built; share it behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySet {
    names: IndexSet<&'static str>,
}

/// Interned form of `name` when it may ever be granted.
fn known(name: &str) -> Option<&'static str> {
    MINIMAL
        .iter()
        .chain(STANDARD_EXTRAS)
        .chain(STANDARD_EXCEPTIONS)
        .chain(OPTIONAL)
        .copied()
        .find(|&candidate| candidate == name)
}

impl CapabilitySet {
    /// The first-lesson builtins, common helpers and the usual exception types.
    pub fn standard() -> Self {
        let names = MINIMAL
            .iter()
            .chain(STANDARD_EXTRAS)
            .chain(STANDARD_EXCEPTIONS)
            .copied()
            .collect();
        Self { names }
    }

    /// The builtins of a first lesson and no exception types.
    pub fn minimal() -> Self {
        Self {
            names: MINIMAL.iter().copied().collect(),
        }
    }

    /// Builds a set from configured names. Unknown names, and names that would
    /// hand out file, import or reflection access, are an error, never
    /// silently ignored.
    pub fn from_names<I, S>(names: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = IndexSet::new();
        for name in names {
            let name = name.as_ref().trim();
            let interned =
                known(name).ok_or_else(|| ConfigError::UnknownCapability(name.to_string()))?;
            set.insert(interned);
        }
        Ok(Self { names: set })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// Bound names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.names.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl Default for CapabilitySet {
    fn default() -> Self {
        Self::standard()
    }
}
