//! Fixtures shared by the unit tests

use std::sync::Arc;

use kube::api::ObjectMeta;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use appbundle_common::crd::{AppBundle, AppBundleSpec, Component, Group, PorchPackageRef};
use appbundle_common::events::NoopEventPublisher;

use crate::client::{MockBundleClient, MockClusterClient};
use crate::controller::{Context, ControllerConfig};

/// Context around `cluster` with a bundle client that accepts every write
pub fn context(cluster: MockClusterClient) -> Context {
    let mut bundles = MockBundleClient::new();
    bundles.expect_patch_status().returning(|_, _, _| Ok(()));
    bundles.expect_add_finalizer().returning(|_, _| Ok(()));
    bundles.expect_remove_finalizer().returning(|_, _| Ok(()));
    Context::new(
        Arc::new(cluster),
        Arc::new(bundles),
        Arc::new(NoopEventPublisher),
        ControllerConfig::default(),
        CancellationToken::new(),
    )
}

/// Bundle `shop` in namespace `shop`, generation 1, without a finalizer
pub fn bundle_with_groups(groups: Vec<Group>) -> AppBundle {
    AppBundle {
        metadata: ObjectMeta {
            name: Some("shop".to_string()),
            namespace: Some("shop".to_string()),
            uid: Some("0b9a7c3e-shop".to_string()),
            generation: Some(1),
            ..Default::default()
        },
        spec: AppBundleSpec {
            groups,
            porch_integration: None,
        },
        status: None,
    }
}

pub fn group(name: &str, order: u32, components: Vec<Component>) -> Group {
    Group {
        name: name.to_string(),
        order,
        components,
    }
}

pub fn component(name: &str, order: u32, template: Value) -> Component {
    Component {
        name: name.to_string(),
        order,
        template: Some(template),
        porch_package_ref: None,
    }
}

/// Component deployed from upstream package `package` at its default revision
pub fn packaged_component(name: &str, order: u32, package: &str) -> Component {
    Component {
        name: name.to_string(),
        order,
        template: None,
        porch_package_ref: Some(PorchPackageRef {
            name: package.to_string(),
            ..Default::default()
        }),
    }
}
