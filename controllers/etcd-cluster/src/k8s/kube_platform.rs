//! Production `Platform` implementation over the kube client.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Secret, Service};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client};

use super::{Platform, PlatformError};

/// The shared kube client, safe for concurrent use across cluster workers.
#[derive(Clone)]
pub struct KubePlatform {
    client: Client,
}

impl KubePlatform {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pvcs(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait::async_trait]
impl Platform for KubePlatform {
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, PlatformError> {
        Ok(self.pods(namespace).create(&PostParams::default(), pod).await?)
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: u32,
    ) -> Result<(), PlatformError> {
        let dp = DeleteParams {
            grace_period_seconds: Some(grace_period_seconds),
            ..Default::default()
        };
        self.pods(namespace).delete(name, &dp).await?;
        Ok(())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Pod>, PlatformError> {
        let lp = ListParams::default().labels(label_selector);
        Ok(self.pods(namespace).list(&lp).await?.items)
    }

    async fn create_pvc(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<(), PlatformError> {
        self.pvcs(namespace).create(&PostParams::default(), pvc).await?;
        Ok(())
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<(), PlatformError> {
        self.pvcs(namespace).delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn list_pvcs(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<PersistentVolumeClaim>, PlatformError> {
        let lp = ListParams::default().labels(label_selector);
        Ok(self.pvcs(namespace).list(&lp).await?.items)
    }

    async fn create_service(&self, namespace: &str, svc: &Service) -> Result<(), PlatformError> {
        self.services(namespace).create(&PostParams::default(), svc).await?;
        Ok(())
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), PlatformError> {
        self.services(namespace).delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn list_services(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Service>, PlatformError> {
        let lp = ListParams::default().labels(label_selector);
        Ok(self.services(namespace).list(&lp).await?.items)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, PlatformError> {
        Ok(self.secrets(namespace).get(name).await?)
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<(), PlatformError> {
        self.deployments(namespace)
            .create(&PostParams::default(), deployment)
            .await?;
        Ok(())
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Deployment, PlatformError> {
        Ok(self.deployments(namespace).get(name).await?)
    }

    async fn patch_deployment(
        &self,
        namespace: &str,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<(), PlatformError> {
        let pp = PatchParams::default();
        self.deployments(namespace)
            .patch(name, &pp, &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), PlatformError> {
        self.deployments(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }
}
