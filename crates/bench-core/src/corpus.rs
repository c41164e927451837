//! Id corpus loading.
//!
//! Patient ids are paged out of every backend partition through the read
//! node and rewritten into the gateway's `ms<partition>-<id>` form. A sample
//! of encounters belonging to the first patients of each partition is loaded
//! alongside so that updates have real documents to modify.

use crate::config::{base_url_string, CorpusConfig};
use anyhow::{Context, Result};
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use tracing::info;

/// Ordered, read-only set of entity ids sampled by the runners.
#[derive(Debug, Clone, Default)]
pub struct IdCorpus {
    ids: Vec<String>,
}

impl IdCorpus {
    pub fn new(ids: Vec<String>) -> Self {
        Self { ids }
    }

    /// Generated ids spread evenly across partitions, for runs without a server.
    pub fn synthetic(partitions: u32, size: usize) -> Self {
        let partitions = partitions.max(1) as usize;
        let ids = (0..size)
            .map(|i| format!("ms{}-{}", i % partitions + 1, i / partitions + 1))
            .collect();
        Self { ids }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.ids.get(index).map(String::as_str)
    }

    /// Uniformly random id; repeats are expected.
    pub fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&str> {
        if self.ids.is_empty() {
            return None;
        }
        self.get(rng.gen_range(0..self.ids.len()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }
}

/// Encounter documents keyed by gateway id, used to build update payloads.
#[derive(Debug, Clone, Default)]
pub struct EncounterStore {
    resources: HashMap<String, Value>,
}

impl EncounterStore {
    pub fn insert(&mut self, id: String, resource: Value) {
        self.resources.insert(id, resource);
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Value> {
        self.resources.get(id)
    }

    /// Copy of the stored encounter with its status replaced. Unknown ids get
    /// a bare encounter document.
    pub fn with_status(&self, id: &str, status: &str) -> Value {
        let mut resource = self.resources.get(id).cloned().unwrap_or_else(|| {
            json!({
                "resourceType": "Encounter",
                "id": id,
            })
        });
        if let Some(obj) = resource.as_object_mut() {
            obj.insert("status".to_string(), Value::String(status.to_string()));
        }
        resource
    }
}

/// Everything the runners draw from.
#[derive(Debug, Clone, Default)]
pub struct LoadedCorpus {
    pub patients: IdCorpus,
    pub encounters: IdCorpus,
    pub encounter_store: EncounterStore,
}

impl LoadedCorpus {
    /// Synthetic corpus for mock runs: encounters reuse the patient ids.
    pub fn synthetic(partitions: u32, size: usize) -> Self {
        let patients = IdCorpus::synthetic(partitions, size);
        Self {
            encounters: patients.clone(),
            patients,
            encounter_store: EncounterStore::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Bundle {
    #[serde(default)]
    entry: Vec<BundleEntry>,
    #[serde(default)]
    link: Vec<BundleLink>,
}

#[derive(Debug, Deserialize)]
struct BundleEntry {
    resource: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct BundleLink {
    relation: String,
    url: String,
}

impl Bundle {
    fn next_url(&self) -> Option<&str> {
        self.link
            .iter()
            .find(|l| l.relation == "next")
            .map(|l| l.url.as_str())
    }

    fn into_resources(self) -> impl Iterator<Item = Value> {
        self.entry.into_iter().filter_map(|e| e.resource)
    }
}

/// Pages ids out of the read node, one partition at a time.
pub struct CorpusLoader {
    client: reqwest::Client,
    read_node_base_url: String,
    config: CorpusConfig,
}

impl CorpusLoader {
    pub fn new(client: reqwest::Client, read_node_base_url: &url::Url, config: CorpusConfig) -> Self {
        Self {
            client,
            read_node_base_url: base_url_string(read_node_base_url),
            config,
        }
    }

    /// Loads `corpus_size / partition_count` patients (and matching
    /// encounters) from every partition.
    pub async fn load(&self, partition_count: u32, corpus_size: usize) -> Result<LoadedCorpus> {
        let per_partition = corpus_size / partition_count.max(1) as usize;
        let mut patients = Vec::new();
        let mut encounters = Vec::new();
        let mut encounter_store = EncounterStore::default();

        for partition in 1..=partition_count {
            let (gateway_ids, sample) = self
                .load_patients(partition, per_partition)
                .await
                .with_context(|| format!("Failed to load patients for partition {partition}"))?;
            patients.extend(gateway_ids);

            let loaded = self
                .load_encounters(partition, per_partition, &sample)
                .await
                .with_context(|| format!("Failed to load encounters for partition {partition}"))?;
            for (id, resource) in loaded {
                encounters.push(id.clone());
                encounter_store.insert(id, resource);
            }
        }

        info!(
            "Loaded corpus: {} patients, {} encounters",
            patients.len(),
            encounters.len()
        );

        Ok(LoadedCorpus {
            patients: IdCorpus::new(patients),
            encounters: IdCorpus::new(encounters),
            encounter_store,
        })
    }

    /// Returns the gateway ids plus the raw ids of the first few patients,
    /// whose encounters are loaded next.
    async fn load_patients(&self, partition: u32, limit: usize) -> Result<(Vec<String>, Vec<String>)> {
        let mut gateway_ids = Vec::new();
        let mut sample = Vec::new();
        let mut url = format!(
            "{}/MS{}/Patient?_count={}&_elements=id",
            self.read_node_base_url, partition, self.config.page_size
        );
        let mut page_idx = 0u32;

        info!("Loading Patient list page 0 for partition {}...", partition);
        loop {
            let bundle = self.fetch_page(&url).await?;
            let next = bundle.next_url().map(str::to_string);

            for resource in bundle.into_resources() {
                let Some(id) = resource.get("id").and_then(Value::as_str) else {
                    continue;
                };
                if gateway_ids.len() < limit {
                    gateway_ids.push(gateway_id(partition, id));
                }
                if sample.len() < self.config.encounter_patients {
                    sample.push(id.to_string());
                }
            }

            match next {
                Some(next) if gateway_ids.len() < limit => {
                    page_idx += 1;
                    info!(
                        "Loading Patient list page {} for partition {}, have {} ids...",
                        page_idx,
                        partition,
                        gateway_ids.len()
                    );
                    url = next;
                }
                _ => break,
            }
        }

        info!(
            "Done loading Patient list for partition {}, have {} ids",
            partition,
            gateway_ids.len()
        );
        Ok((gateway_ids, sample))
    }

    async fn load_encounters(
        &self,
        partition: u32,
        limit: usize,
        patient_ids: &[String],
    ) -> Result<Vec<(String, Value)>> {
        let mut encounters: Vec<(String, Value)> = Vec::new();

        for batch in patient_ids.chunks(self.config.encounter_batch.max(1)) {
            if encounters.len() >= limit {
                break;
            }
            let refs: Vec<String> = batch.iter().map(|id| format!("Patient/{id}")).collect();
            let mut url = format!(
                "{}/MS{}/Encounter?patient={}&_count={}",
                self.read_node_base_url,
                partition,
                refs.join(","),
                self.config.encounter_batch
            );

            loop {
                let bundle = self.fetch_page(&url).await?;
                let next = bundle.next_url().map(str::to_string);

                for mut resource in bundle.into_resources() {
                    if encounters.len() >= limit {
                        break;
                    }
                    let Some(id) = resource.get("id").and_then(Value::as_str) else {
                        continue;
                    };
                    let id = gateway_id(partition, id);
                    rewrite_for_gateway(&mut resource, partition, &id);
                    encounters.push((id, resource));
                }

                match next {
                    Some(next) if encounters.len() < limit => url = next,
                    _ => break,
                }
            }
        }

        info!(
            "Done loading Encounter list for partition {}, have {} ids",
            partition,
            encounters.len()
        );
        Ok(encounters)
    }

    /// GETs one bundle page, retrying the same request on any failure.
    async fn fetch_page(&self, url: &str) -> Result<Bundle> {
        let max = self.config.max_page_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.try_fetch_page(url).await {
                Ok(bundle) => return Ok(bundle),
                Err(e) if attempt < max => {
                    info!(
                        "Failure loading page URL (retry {} / {}): {}: {:#}",
                        attempt, max, url, e
                    );
                    attempt += 1;
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Giving up on page URL after {max} attempts: {url}")
                    })
                }
            }
        }
    }

    async fn try_fetch_page(&self, url: &str) -> Result<Bundle> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/fhir+json")
            .send()
            .await?
            .error_for_status()?;
        let bundle = response.json::<Bundle>().await?;
        Ok(bundle)
    }
}

fn gateway_id(partition: u32, id: &str) -> String {
    format!("ms{partition}-{id}")
}

/// Points an encounter and every reference inside it at gateway ids, and
/// drops the version so updates are not rejected as stale.
fn rewrite_for_gateway(resource: &mut Value, partition: u32, id: &str) {
    if let Some(obj) = resource.as_object_mut() {
        obj.insert("id".to_string(), Value::String(id.to_string()));
        if let Some(meta) = obj.get_mut("meta").and_then(Value::as_object_mut) {
            meta.remove("versionId");
        }
    }
    rewrite_references(resource, partition);
}

fn rewrite_references(value: &mut Value, partition: u32) {
    match value {
        Value::Object(obj) => {
            rewrite_reference_field(obj, partition);
            for child in obj.values_mut() {
                rewrite_references(child, partition);
            }
        }
        Value::Array(items) => {
            for item in items {
                rewrite_references(item, partition);
            }
        }
        _ => {}
    }
}

fn rewrite_reference_field(obj: &mut Map<String, Value>, partition: u32) {
    let Some(Value::String(reference)) = obj.get("reference") else {
        return;
    };
    // Relative or absolute, the target is the last `Type/id` pair once a
    // `_history/<version>` suffix is dropped.
    let mut parts: Vec<&str> = reference.split('/').filter(|p| !p.is_empty()).collect();
    if parts.len() >= 4 && parts[parts.len() - 2] == "_history" {
        parts.truncate(parts.len() - 2);
    }
    let [.., resource_type, id] = parts.as_slice() else {
        return;
    };
    let rewritten = format!("{resource_type}/{}", gateway_id(partition, id));
    obj.insert("reference".to_string(), Value::String(rewritten));
}
