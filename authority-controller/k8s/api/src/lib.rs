#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod policy;

pub use k8s_openapi::{
    api::{
        self,
        admissionregistration::v1::MutatingWebhookConfiguration,
        apps::v1::Deployment,
        authentication::v1::TokenReview,
        core::v1::{ConfigMap, Namespace, Pod, Secret},
    },
    ByteString,
};
pub use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams, PostParams, ResourceExt},
    Client, Error, Resource,
};
