use std::fmt::{self, Display};
use std::hash::{self, Hash};

/// A basic description of a Kubernetes resource, with just enough information to allow the operator
/// to communicate with the api server. We use `&'static str` for all of these so that it's easy
/// to pass references around without copying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct K8sType {
    pub api_version: &'static str,
    pub kind: &'static str,
    pub plural_kind: &'static str,
}

impl Hash for K8sType {
    fn hash<H: hash::Hasher>(&self, hasher: &mut H) {
        self.api_version.hash(hasher);
        self.kind.hash(hasher);
    }
}

impl K8sType {
    pub fn as_group_and_version(&self) -> (&'static str, &'static str) {
        match self.api_version.find('/') {
            Some(slash_idx) => (
                &self.api_version[..slash_idx],
                &self.api_version[(slash_idx + 1)..],
            ),
            None => ("", self.api_version),
        }
    }

    pub fn group(&self) -> &'static str {
        self.as_group_and_version().0
    }

    pub fn version(&self) -> &'static str {
        self.as_group_and_version().1
    }

    /// returns true if the given apiVersion and kind refer to this type
    pub fn matches(&self, api_version: &str, kind: &str) -> bool {
        self.api_version == api_version && self.kind == kind
    }
}

impl Display for K8sType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.api_version, self.plural_kind)
    }
}

macro_rules! k8s_type {
    ($ref_name:ident, $api_version:expr, $kind:expr, $plural_kind:expr) => {
        #[allow(non_upper_case_globals)]
        pub static $ref_name: &crate::k8s_types::K8sType = &crate::k8s_types::K8sType {
            api_version: $api_version,
            kind: $kind,
            plural_kind: $plural_kind,
        };
    };
}

/// The Application custom resource that describes the desired workload
pub static APPLICATION: &K8sType = &K8sType {
    api_version: "configuration.github.com/v1",
    kind: "Application",
    plural_kind: "applications",
};

pub mod core {
    pub mod v1 {
        k8s_type!(Service, "v1", "Service", "services");
    }
}

pub mod apps {
    pub mod v1 {
        k8s_type!(Deployment, "apps/v1", "Deployment", "deployments");
    }
}

pub mod networking_k8s_io {
    pub mod v1 {
        k8s_type!(Ingress, "networking.k8s.io/v1", "Ingress", "ingresses");
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn k8s_type_returns_group_and_api_version_when_both_are_present() {
        let subject = networking_k8s_io::v1::Ingress;
        assert_eq!("networking.k8s.io", subject.group());
        assert_eq!("v1", subject.version());
    }

    #[test]
    fn k8s_type_returns_empty_str_for_group_when_no_group_is_present() {
        let subject = core::v1::Service;
        assert_eq!("", subject.group());
        assert_eq!("v1", subject.version());
    }

    #[test]
    fn application_type_lives_in_the_configuration_group() {
        assert_eq!("configuration.github.com", APPLICATION.group());
        assert!(APPLICATION.matches("configuration.github.com/v1", "Application"));
        assert!(!APPLICATION.matches("v1", "Application"));
    }
}
