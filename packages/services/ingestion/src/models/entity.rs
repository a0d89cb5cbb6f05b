use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::models::IngestionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Body,
    Organization,
    Person,
    Membership,
    Meeting,
    AgendaItem,
    Paper,
    Consultation,
    File,
    Location,
    LegislativeTerm,
}

impl EntityType {
    pub const ALL: [EntityType; 11] = [
        EntityType::Body,
        EntityType::Organization,
        EntityType::Person,
        EntityType::Membership,
        EntityType::Meeting,
        EntityType::AgendaItem,
        EntityType::Paper,
        EntityType::Consultation,
        EntityType::File,
        EntityType::Location,
        EntityType::LegislativeTerm,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Body => "body",
            EntityType::Organization => "organization",
            EntityType::Person => "person",
            EntityType::Membership => "membership",
            EntityType::Meeting => "meeting",
            EntityType::AgendaItem => "agenda_item",
            EntityType::Paper => "paper",
            EntityType::Consultation => "consultation",
            EntityType::File => "file",
            EntityType::Location => "location",
            EntityType::LegislativeTerm => "legislative_term",
        }
    }

    /// Name of the OParl schema type, as it appears at the end of the `type` URI.
    pub fn oparl_name(&self) -> &'static str {
        match self {
            EntityType::Body => "Body",
            EntityType::Organization => "Organization",
            EntityType::Person => "Person",
            EntityType::Membership => "Membership",
            EntityType::Meeting => "Meeting",
            EntityType::AgendaItem => "AgendaItem",
            EntityType::Paper => "Paper",
            EntityType::Consultation => "Consultation",
            EntityType::File => "File",
            EntityType::Location => "Location",
            EntityType::LegislativeTerm => "LegislativeTerm",
        }
    }

    pub fn collection_name(&self) -> String {
        format!("oparl_{}", self.as_str())
    }

    /// Change event topic for this entity type.
    pub fn topic(&self) -> String {
        format!("oparl:{}", self.as_str())
    }

    /// Parse an OParl type URI such as `https://schema.oparl.org/1.1/Paper`.
    pub fn from_type_uri(uri: &str) -> Option<EntityType> {
        let name = uri.trim_end_matches('/').rsplit('/').next()?;
        EntityType::ALL.iter().copied().find(|t| t.oparl_name() == name)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = IngestionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s || t.oparl_name().eq_ignore_ascii_case(s))
            .ok_or_else(|| IngestionError::Configuration(format!("Unknown entity type: {}", s)))
    }
}

/// A resolved relationship from one stored entity to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityLink {
    pub relation: String,
    pub target_type: EntityType,
    pub target_id: String,
}

/// The owner of a File. A File is attached to exactly one Paper or Meeting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileParent {
    pub entity_type: EntityType,
    pub external_id: String,
    pub role: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Body {
    pub name: Option<String>,
    pub short_name: Option<String>,
    pub website: Option<String>,
    pub classification: Option<String>,
    pub organization_list: Option<String>,
    pub person_list: Option<String>,
    pub meeting_list: Option<String>,
    pub paper_list: Option<String>,
    pub legislative_terms: Vec<String>,
    pub location: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    pub name: Option<String>,
    pub short_name: Option<String>,
    pub organization_type: Option<String>,
    pub classification: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub sub_organization_of: Option<String>,
    pub location: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub name: Option<String>,
    pub family_name: Option<String>,
    pub given_name: Option<String>,
    pub title: Vec<String>,
    pub gender: Option<String>,
    pub status: Vec<String>,
    pub memberships: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    pub person: Option<String>,
    pub organization: Option<String>,
    pub role: Option<String>,
    pub voting_right: Option<bool>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Meeting {
    pub name: Option<String>,
    pub meeting_state: Option<String>,
    pub cancelled: Option<bool>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub location: Option<String>,
    pub organizations: Vec<String>,
    pub agenda_items: Vec<String>,
    pub invitation: Option<String>,
    pub results_protocol: Option<String>,
    pub verbatim_protocol: Option<String>,
    pub auxiliary_files: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgendaItem {
    pub meeting: Option<String>,
    pub number: Option<String>,
    pub order: Option<i64>,
    pub name: Option<String>,
    pub public: Option<bool>,
    pub consultation: Option<String>,
    pub result: Option<String>,
    pub resolution_text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Paper {
    pub name: Option<String>,
    pub reference: Option<String>,
    pub date: Option<NaiveDate>,
    pub paper_type: Option<String>,
    pub main_file: Option<String>,
    pub auxiliary_files: Vec<String>,
    pub consultations: Vec<String>,
    pub related_papers: Vec<String>,
    pub under_direction_of: Vec<String>,
    pub originator_persons: Vec<String>,
    pub originator_organizations: Vec<String>,
    pub locations: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Consultation {
    pub paper: Option<String>,
    pub agenda_item: Option<String>,
    pub meeting: Option<String>,
    pub organizations: Vec<String>,
    pub authoritative: Option<bool>,
    pub role: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct File {
    pub name: Option<String>,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub size: Option<i64>,
    pub access_url: Option<String>,
    pub download_url: Option<String>,
    pub date: Option<NaiveDate>,
    pub parent: Option<FileParent>,
}

impl File {
    /// Preferred URL to fetch the file bytes from.
    pub fn fetch_url(&self) -> Option<&str> {
        self.download_url
            .as_deref()
            .or(self.access_url.as_deref())
            .filter(|u| !u.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub description: Option<String>,
    pub street_address: Option<String>,
    pub room: Option<String>,
    pub postal_code: Option<String>,
    pub locality: Option<String>,
    pub geojson: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LegislativeTerm {
    pub name: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

/// Typed canonical record for each entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityRecord {
    Body(Body),
    Organization(Organization),
    Person(Person),
    Membership(Membership),
    Meeting(Meeting),
    AgendaItem(AgendaItem),
    Paper(Paper),
    Consultation(Consultation),
    File(File),
    Location(Location),
    LegislativeTerm(LegislativeTerm),
}

impl EntityRecord {
    pub fn entity_type(&self) -> EntityType {
        match self {
            EntityRecord::Body(_) => EntityType::Body,
            EntityRecord::Organization(_) => EntityType::Organization,
            EntityRecord::Person(_) => EntityType::Person,
            EntityRecord::Membership(_) => EntityType::Membership,
            EntityRecord::Meeting(_) => EntityType::Meeting,
            EntityRecord::AgendaItem(_) => EntityType::AgendaItem,
            EntityRecord::Paper(_) => EntityType::Paper,
            EntityRecord::Consultation(_) => EntityType::Consultation,
            EntityRecord::File(_) => EntityType::File,
            EntityRecord::Location(_) => EntityType::Location,
            EntityRecord::LegislativeTerm(_) => EntityType::LegislativeTerm,
        }
    }

    /// Outgoing references this record needs resolved against other stored entities:
    /// `(relation, target type, target external id)`.
    pub fn references(&self) -> Vec<(String, EntityType, String)> {
        let mut refs = Vec::new();
        match self {
            EntityRecord::Consultation(c) => {
                if let Some(p) = &c.paper {
                    refs.push(("paper".to_string(), EntityType::Paper, p.clone()));
                }
                if let Some(m) = &c.meeting {
                    refs.push(("meeting".to_string(), EntityType::Meeting, m.clone()));
                }
                if let Some(a) = &c.agenda_item {
                    refs.push(("agenda_item".to_string(), EntityType::AgendaItem, a.clone()));
                }
                for o in &c.organizations {
                    refs.push(("organization".to_string(), EntityType::Organization, o.clone()));
                }
            }
            EntityRecord::Membership(m) => {
                if let Some(p) = &m.person {
                    refs.push(("person".to_string(), EntityType::Person, p.clone()));
                }
                if let Some(o) = &m.organization {
                    refs.push(("organization".to_string(), EntityType::Organization, o.clone()));
                }
            }
            EntityRecord::AgendaItem(a) => {
                if let Some(m) = &a.meeting {
                    refs.push(("meeting".to_string(), EntityType::Meeting, m.clone()));
                }
                if let Some(c) = &a.consultation {
                    refs.push(("consultation".to_string(), EntityType::Consultation, c.clone()));
                }
            }
            EntityRecord::File(f) => {
                if let Some(parent) = &f.parent {
                    refs.push(("parent".to_string(), parent.entity_type, parent.external_id.clone()));
                }
            }
            _ => {}
        }
        refs
    }

    pub fn as_file(&self) -> Option<&File> {
        match self {
            EntityRecord::File(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_consultation(&self) -> Option<&Consultation> {
        match self {
            EntityRecord::Consultation(c) => Some(c),
            _ => None,
        }
    }
}

/// Output of the normalizer: one canonical entity ready for upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEntity {
    pub external_id: String,
    pub body_id: String,
    pub remote_modified: Option<DateTime<Utc>>,
    pub remote_created: Option<DateTime<Utc>>,
    pub deleted: bool,
    pub record: EntityRecord,
    pub raw_payload: serde_json::Value,
}

impl NormalizedEntity {
    pub fn entity_type(&self) -> EntityType {
        self.record.entity_type()
    }

    /// Timestamp used for change detection: `modified`, falling back to `created`.
    pub fn change_marker(&self) -> Option<DateTime<Utc>> {
        self.remote_modified.or(self.remote_created)
    }
}

/// Persisted form of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntity {
    pub entity_type: EntityType,
    pub external_id: String,
    pub body_id: String,
    pub source_id: String,
    pub record: EntityRecord,
    #[serde(default)]
    pub links: Vec<EntityLink>,
    pub raw_payload: serde_json::Value,
    pub payload_sha256: String,
    pub remote_modified: Option<DateTime<Utc>>,
    pub remote_created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted: bool,
    pub stored_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredEntity {
    pub fn change_marker(&self) -> Option<DateTime<Utc>> {
        self.remote_modified.or(self.remote_created)
    }

    pub fn link(&self, relation: &str) -> Option<&EntityLink> {
        self.links.iter().find(|l| l.relation == relation)
    }

    pub fn add_link(&mut self, link: EntityLink) -> bool {
        if self.links.contains(&link) {
            return false;
        }
        self.links.push(link);
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

impl UpsertOutcome {
    pub fn is_change(&self) -> bool {
        !matches!(self, UpsertOutcome::Unchanged)
    }
}
