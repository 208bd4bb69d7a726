//! Every Kubernetes resource has an id, which is the combination of the
//! `namespace` and `name` fields from the `metadata`. The `uid` is only used
//! to tell apart two resources that had the same id at different times.
//!
//! An Application's id doubles as the workqueue key: the operator never has
//! more than one reconciliation in flight for a given id. The managed
//! children share the id of the Application that owns them.
//!
//! `ObjectId` is the _owned_ form, while `ObjectIdRef` _borrows_ its fields
//! (typically from a json `Value`). Functions that accept
//! `impl Into<ObjectIdRef<'_>>` take either one, as well as `(&str, &str)`.
//!
//! Missing namespaces are represented as empty strings in both forms. The
//! `namespace()` accessors return `None` for those.
use std::fmt::{self, Display};

/// An owned Object Id
#[derive(Debug, PartialEq, Eq, Hash, Clone, PartialOrd, Ord)]
pub struct ObjectId {
    pub namespace: String,
    pub name: String,
}

impl ObjectId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> ObjectId {
        ObjectId {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// return an `ObjectIdRef` that borrows its fields from this id
    pub fn as_id_ref(&self) -> ObjectIdRef {
        ObjectIdRef {
            namespace: &self.namespace,
            name: &self.name,
        }
    }

    /// Returns an option containing a non-empty namespace. Will return None
    /// if the namespace is an empty string.
    pub fn namespace(&self) -> Option<&str> {
        self.as_id_ref().namespace()
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.as_id_ref().fmt(f)
    }
}

/// An id that borrows its fields
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct ObjectIdRef<'a> {
    pub namespace: &'a str,
    pub name: &'a str,
}

impl<'a> ObjectIdRef<'a> {
    pub fn new(namespace: &'a str, name: &'a str) -> ObjectIdRef<'a> {
        ObjectIdRef { namespace, name }
    }

    /// Create an owned `ObjectId` by copying the borrowed fields
    pub fn to_owned(&self) -> ObjectId {
        ObjectId {
            namespace: self.namespace.to_owned(),
            name: self.name.to_owned(),
        }
    }

    /// Returns an option containing a non-empty namespace. Will return None
    /// if the namespace is an empty string.
    pub fn namespace(&self) -> Option<&'a str> {
        if self.namespace.is_empty() {
            None
        } else {
            Some(self.namespace)
        }
    }

    pub fn name(&self) -> &'a str {
        self.name
    }
}

impl<'a> Display for ObjectIdRef<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl<'a> PartialEq<ObjectIdRef<'a>> for ObjectId {
    fn eq(&self, other: &ObjectIdRef<'a>) -> bool {
        self.namespace == other.namespace && self.name == other.name
    }
}

impl<'a> PartialEq<ObjectId> for ObjectIdRef<'a> {
    fn eq(&self, other: &ObjectId) -> bool {
        self.namespace == other.namespace && self.name == other.name
    }
}

impl<'a> From<&'a ObjectId> for ObjectIdRef<'a> {
    fn from(id: &'a ObjectId) -> ObjectIdRef<'a> {
        id.as_id_ref()
    }
}

impl<'a> From<(&'a str, &'a str)> for ObjectIdRef<'a> {
    fn from((namespace, name): (&'a str, &'a str)) -> ObjectIdRef<'a> {
        ObjectIdRef { namespace, name }
    }
}
