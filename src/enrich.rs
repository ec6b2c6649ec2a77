use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;

use crate::models::{Client, Project, Tag, TimeEntry};

pub type TagDirectory = HashMap<u64, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<'a, T> {
    Found(&'a T),
    Unset,
    Missing(u64),
}

impl<'a, T> Lookup<'a, T> {
    pub fn found(self) -> Option<&'a T> {
        match self {
            Lookup::Found(value) => Some(value),
            Lookup::Unset | Lookup::Missing(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnrichedProject {
    #[serde(flatten)]
    pub project: Project,
    pub client: Option<Client>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnrichedTimeEntry {
    #[serde(flatten)]
    pub entry: TimeEntry,
    pub project: Option<EnrichedProject>,
    pub tag_names: Vec<String>,
}

impl EnrichedTimeEntry {
    pub fn id(&self) -> u64 {
        self.entry.id
    }

    pub fn description(&self) -> &str {
        self.entry.description.as_deref().unwrap_or_default()
    }
}

pub fn enrich(
    entry: Option<&TimeEntry>,
    projects: &[Project],
    clients: &[Client],
    tags: &TagDirectory,
) -> Option<EnrichedTimeEntry> {
    entry.map(|entry| enrich_entry(entry, projects, clients, tags))
}

pub fn enrich_entry(
    entry: &TimeEntry,
    projects: &[Project],
    clients: &[Client],
    tags: &TagDirectory,
) -> EnrichedTimeEntry {
    let project = match find_project(entry.project_id, projects) {
        Lookup::Found(project) => Some(project),
        Lookup::Unset => None,
        Lookup::Missing(id) => {
            debug!(entry_id = entry.id, project_id = id, "project not loaded");
            None
        }
    };
    let project = project.map(|project| {
        let client = find_client(project.client_id, clients);
        if let Lookup::Missing(id) = client {
            debug!(project_id = project.id, client_id = id, "client not loaded");
        }
        EnrichedProject {
            client: client.found().cloned(),
            project: project.clone(),
        }
    });

    EnrichedTimeEntry {
        entry: entry.clone(),
        project,
        tag_names: resolve_tag_names(&entry.tag_ids, tags),
    }
}

pub fn find_project(project_id: Option<u64>, projects: &[Project]) -> Lookup<'_, Project> {
    lookup_by_id(project_id, projects, |project| project.id)
}

pub fn find_client(client_id: Option<u64>, clients: &[Client]) -> Lookup<'_, Client> {
    lookup_by_id(client_id, clients, |client| client.id)
}

pub fn resolve_tag_names(tag_ids: &[u64], tags: &TagDirectory) -> Vec<String> {
    tag_ids
        .iter()
        .filter_map(|id| tags.get(id).cloned())
        .collect()
}

pub fn tag_directory(tags: &[Tag]) -> TagDirectory {
    tags.iter().map(|tag| (tag.id, tag.name.clone())).collect()
}

fn lookup_by_id<T>(id: Option<u64>, items: &[T], id_of: impl Fn(&T) -> u64) -> Lookup<'_, T> {
    let Some(id) = id else {
        return Lookup::Unset;
    };
    items
        .iter()
        .find(|item| id_of(item) == id)
        .map_or(Lookup::Missing(id), Lookup::Found)
}
