//! Execution-environment capabilities.
//!
//! Some runtimes (browser/wasm hosts, managed sandboxes) hand sockets to the
//! host and give the client no control over proxies or client certificates.
//! Pipelines built there use a plain transport and skip the layers that
//! would need those controls.

/// Facts about the process that affect pipeline topology.
pub trait ExecutionEnvironment: Send + Sync {
    /// `true` when the runtime owns the network stack.
    fn is_restricted_runtime(&self) -> bool;
}

/// Returns `true` if proxies, client certificates and socket-level handlers
/// may be configured in `environment`.
#[must_use]
pub fn supports_native_transport_controls(environment: &dyn ExecutionEnvironment) -> bool {
    !environment.is_restricted_runtime()
}

/// Fixed capability description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeEnvironment {
    restricted: bool,
}

impl RuntimeEnvironment {
    /// The environment this binary was compiled for.
    #[must_use]
    pub const fn host() -> Self {
        Self {
            restricted: cfg!(target_family = "wasm"),
        }
    }

    /// A runtime without proxy or certificate control.
    #[must_use]
    pub const fn restricted() -> Self {
        Self { restricted: true }
    }

    /// A runtime with full socket control.
    #[must_use]
    pub const fn unrestricted() -> Self {
        Self { restricted: false }
    }
}

impl Default for RuntimeEnvironment {
    fn default() -> Self {
        Self::host()
    }
}

impl ExecutionEnvironment for RuntimeEnvironment {
    fn is_restricted_runtime(&self) -> bool {
        self.restricted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restricted_runtime_has_no_native_controls() {
        assert!(!supports_native_transport_controls(
            &RuntimeEnvironment::restricted()
        ));
        assert!(supports_native_transport_controls(
            &RuntimeEnvironment::unrestricted()
        ));
    }

    #[cfg(not(target_family = "wasm"))]
    #[test]
    fn native_host_is_unrestricted() {
        assert_eq!(RuntimeEnvironment::host(), RuntimeEnvironment::unrestricted());
        assert_eq!(RuntimeEnvironment::default(), RuntimeEnvironment::host());
    }

    #[test]
    fn custom_environment_is_honoured() {
        struct Sandbox;

        impl ExecutionEnvironment for Sandbox {
            fn is_restricted_runtime(&self) -> bool {
                true
            }
        }

        assert!(!supports_native_transport_controls(&Sandbox));
    }
}
