//! Minimal GraphQL type model consumed by the mapping and planning layers.
//!
//! Parsing and validating GraphQL schema text is a collaborator concern; this
//! module only carries the type information the planner, elaborator, and
//! cursor need: named type definitions, list/non-null wrapping, field lookup,
//! and interface/implementor relationships.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Built-in scalar names treated as leaves even when not registered.
const BUILTIN_SCALARS: &[&str] = &["Int", "Float", "String", "Boolean", "ID"];

/// A possibly wrapped reference to a named type.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    /// Reference to a named type definition.
    Named(String),
    /// List wrapper.
    List(Box<Type>),
    /// Non-null wrapper.
    NonNull(Box<Type>),
}

impl Type {
    pub fn named(name: impl Into<String>) -> Type {
        Type::Named(name.into())
    }

    pub fn list(inner: Type) -> Type {
        Type::List(Box::new(inner))
    }

    pub fn non_null(inner: Type) -> Type {
        Type::NonNull(Box::new(inner))
    }

    /// True unless the outermost wrapper is `NonNull`.
    pub fn is_nullable(&self) -> bool {
        !matches!(self, Type::NonNull(_))
    }

    /// Strips an outermost `NonNull` wrapper, if any.
    pub fn nullable(&self) -> &Type {
        match self {
            Type::NonNull(inner) => inner,
            other => other,
        }
    }

    /// Whether the type is a list once nullability is stripped.
    pub fn is_list(&self) -> bool {
        matches!(self.nullable(), Type::List(_))
    }

    /// The element type of a list, stripping nullability first.
    pub fn item(&self) -> Option<&Type> {
        match self.nullable() {
            Type::List(inner) => Some(inner),
            _ => None,
        }
    }

    /// The innermost named type.
    pub fn underlying(&self) -> &str {
        match self {
            Type::Named(name) => name,
            Type::List(inner) | Type::NonNull(inner) => inner.underlying(),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Named(name) => write!(f, "{name}"),
            Type::List(inner) => write!(f, "[{inner}]"),
            Type::NonNull(inner) => write!(f, "{inner}!"),
        }
    }
}

/// A field declared by an object or interface type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Field name.
    pub name: String,
    /// Declared field type.
    pub ty: Type,
}

/// Convenience constructor for a [`FieldDef`].
pub fn field(name: impl Into<String>, ty: Type) -> FieldDef {
    FieldDef {
        name: name.into(),
        ty,
    }
}

/// A named type definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TypeDef {
    /// Object type with the interfaces it implements.
    Object {
        name: String,
        interfaces: Vec<String>,
        fields: Vec<FieldDef>,
    },
    /// Interface type.
    Interface { name: String, fields: Vec<FieldDef> },
    /// Custom scalar.
    Scalar { name: String },
    /// Enum with its value names.
    Enum { name: String, values: Vec<String> },
}

impl TypeDef {
    pub fn name(&self) -> &str {
        match self {
            TypeDef::Object { name, .. }
            | TypeDef::Interface { name, .. }
            | TypeDef::Scalar { name }
            | TypeDef::Enum { name, .. } => name,
        }
    }

    fn fields(&self) -> Option<&[FieldDef]> {
        match self {
            TypeDef::Object { fields, .. } | TypeDef::Interface { fields, .. } => Some(fields),
            _ => None,
        }
    }
}

/// Registry of type definitions plus the query root type name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    query_type: String,
    types: HashMap<String, TypeDef>,
}

impl Schema {
    /// Creates an empty schema whose query root is the given type name.
    pub fn new(query_type: impl Into<String>) -> Self {
        Schema {
            query_type: query_type.into(),
            types: HashMap::new(),
        }
    }

    /// Registers an object type.
    pub fn with_object(
        mut self,
        name: impl Into<String>,
        interfaces: &[&str],
        fields: Vec<FieldDef>,
    ) -> Self {
        let name = name.into();
        self.types.insert(
            name.clone(),
            TypeDef::Object {
                name,
                interfaces: interfaces.iter().map(|s| s.to_string()).collect(),
                fields,
            },
        );
        self
    }

    /// Registers an interface type.
    pub fn with_interface(mut self, name: impl Into<String>, fields: Vec<FieldDef>) -> Self {
        let name = name.into();
        self.types
            .insert(name.clone(), TypeDef::Interface { name, fields });
        self
    }

    /// Registers a custom scalar type.
    pub fn with_scalar(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.types.insert(name.clone(), TypeDef::Scalar { name });
        self
    }

    /// Registers an enum type.
    pub fn with_enum(mut self, name: impl Into<String>, values: &[&str]) -> Self {
        let name = name.into();
        self.types.insert(
            name.clone(),
            TypeDef::Enum {
                name,
                values: values.iter().map(|s| s.to_string()).collect(),
            },
        );
        self
    }

    /// The query root as a type reference.
    pub fn query_type(&self) -> Type {
        Type::Named(self.query_type.clone())
    }

    pub fn type_def(&self, name: &str) -> Option<&TypeDef> {
        self.types.get(name)
    }

    /// Resolves a field's declared type on the underlying named type.
    ///
    /// For interfaces, fields declared only on implementors (variant fields)
    /// are also resolved, taking the first implementor that declares them.
    pub fn field_type(&self, tpe: &Type, field: &str) -> Option<Type> {
        let def = self.type_def(tpe.underlying())?;
        if let Some(fd) = def
            .fields()
            .and_then(|fs| fs.iter().find(|f| f.name == field))
        {
            return Some(fd.ty.clone());
        }
        if let TypeDef::Interface { name, .. } = def {
            let iface = name.clone();
            for imp in self.implementors(&iface) {
                if let Some(fd) = self
                    .type_def(imp)
                    .and_then(|d| d.fields())
                    .and_then(|fs| fs.iter().find(|f| f.name == field))
                {
                    return Some(fd.ty.clone());
                }
            }
        }
        None
    }

    /// Object types implementing the given interface, in registration-independent
    /// deterministic (sorted) order.
    pub fn implementors(&self, interface: &str) -> Vec<&str> {
        let mut out: Vec<&str> = self
            .types
            .values()
            .filter_map(|def| match def {
                TypeDef::Object {
                    name, interfaces, ..
                } if interfaces.iter().any(|i| i == interface) => Some(name.as_str()),
                _ => None,
            })
            .collect();
        out.sort_unstable();
        out
    }

    /// Interfaces implemented by the given object type.
    pub fn interfaces_of(&self, object: &str) -> &[String] {
        match self.type_def(object) {
            Some(TypeDef::Object { interfaces, .. }) => interfaces,
            _ => &[],
        }
    }

    pub fn is_interface(&self, name: &str) -> bool {
        matches!(self.type_def(name), Some(TypeDef::Interface { .. }))
    }

    /// Whether the named type encodes as a scalar value.
    pub fn is_leaf(&self, name: &str) -> bool {
        BUILTIN_SCALARS.contains(&name)
            || matches!(
                self.type_def(name),
                Some(TypeDef::Scalar { .. }) | Some(TypeDef::Enum { .. })
            )
    }

    /// Whether the type carries no object structure: a leaf, or any stack of
    /// list/non-null wrappers over a leaf.
    pub fn is_unstructured(&self, tpe: &Type) -> bool {
        self.is_leaf(tpe.underlying())
    }

    /// Walks field names from the query root, returning the type at the end
    /// of the path.
    pub fn type_at_path(&self, path: &[String]) -> Option<Type> {
        let mut tpe = self.query_type();
        for name in path {
            tpe = self.field_type(&tpe, name)?;
        }
        Some(tpe)
    }

    /// Whether `field` is declared by some implementor of `interface` but not
    /// by the interface itself, making its presence subtype-dependent.
    pub fn is_variant_field(&self, interface: &str, field: &str) -> bool {
        let declared_on_interface = self
            .type_def(interface)
            .and_then(|d| d.fields())
            .map(|fs| fs.iter().any(|f| f.name == field))
            .unwrap_or(false);
        if declared_on_interface {
            return false;
        }
        self.implementors(interface).iter().any(|imp| {
            self.type_def(imp)
                .and_then(|d| d.fields())
                .map(|fs| fs.iter().any(|f| f.name == field))
                .unwrap_or(false)
        })
    }

    /// Whether `sub` is `sup` itself or an implementor of it.
    pub fn is_subtype(&self, sub: &str, sup: &str) -> bool {
        sub == sup || self.interfaces_of(sub).iter().any(|i| i == sup)
    }
}
