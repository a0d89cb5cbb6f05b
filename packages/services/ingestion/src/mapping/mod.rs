pub mod fields;

use serde_json::Value;

use crate::models::*;
use fields::*;

/// Embedding context for a nested object: who contains it and in which role.
#[derive(Debug, Clone, Copy)]
struct Owner<'a> {
    entity_type: EntityType,
    external_id: &'a str,
    role: &'a str,
}

/// Maps raw OParl JSON onto typed records.
///
/// One remote object can yield several entities: the object itself first, followed by
/// every embedded object (agenda items of a meeting, consultations and files of a paper,
/// memberships of a person, ...). A broken top-level object is rejected as
/// `IngestionError::Malformed`; a broken embedded object is logged and dropped while its
/// parent survives.
#[derive(Debug, Clone, Default)]
pub struct Normalizer;

impl Normalizer {
    pub fn new() -> Self {
        Self
    }

    /// Normalize one item of a collection of `expected` type. `body_id` is the owning
    /// Body; for Body objects it is ignored and the object's own id is used.
    pub fn normalize(&self, expected: EntityType, body_id: Option<&str>, raw: &Value) -> Result<Vec<NormalizedEntity>> {
        let mut out = Vec::new();
        self.entity(expected, body_id, raw, None, &mut out)?;
        Ok(out)
    }

    fn entity(
        &self,
        expected: EntityType,
        body_hint: Option<&str>,
        raw: &Value,
        owner: Option<Owner<'_>>,
        out: &mut Vec<NormalizedEntity>,
    ) -> Result<String> {
        let obj = raw
            .as_object()
            .ok_or_else(|| IngestionError::Malformed(format!("{} record is not a JSON object", expected)))?;
        let external_id =
            text(obj, "id").ok_or_else(|| IngestionError::Malformed(format!("{} record without id", expected)))?;

        if let Some(type_uri) = text(obj, "type") {
            match EntityType::from_type_uri(&type_uri) {
                Some(t) if t == expected => {}
                Some(t) => {
                    return Err(IngestionError::Malformed(format!(
                        "{} declares type {} where {} was expected",
                        external_id, t, expected
                    )))
                }
                None => tracing::debug!(external_id = %external_id, type_uri = %type_uri, "Unrecognised type URI; accepting as {}", expected),
            }
        }

        let remote_modified = change_timestamp(obj, "modified")
            .map_err(|e| IngestionError::Malformed(format!("{}: {}", external_id, e)))?;
        let remote_created = change_timestamp(obj, "created")
            .map_err(|e| IngestionError::Malformed(format!("{}: {}", external_id, e)))?;
        let deleted = flag(obj, "deleted").unwrap_or(false);

        let body_id = match expected {
            EntityType::Body => external_id.clone(),
            _ => body_hint
                .map(str::to_string)
                .or_else(|| text(obj, "body"))
                .ok_or_else(|| IngestionError::Malformed(format!("{} has no owning body", external_id)))?,
        };

        let me = |role: &'static str| Owner { entity_type: expected, external_id: external_id.as_str(), role };
        let mut children = Vec::new();

        let record = match expected {
            EntityType::Body => EntityRecord::Body(Body {
                name: text(obj, "name"),
                short_name: text(obj, "shortName"),
                website: text(obj, "website"),
                classification: text(obj, "classification"),
                organization_list: text(obj, "organization"),
                person_list: text(obj, "person"),
                meeting_list: text(obj, "meeting"),
                paper_list: text(obj, "paper"),
                legislative_terms: self.embedded_list(obj, "legislativeTerm", EntityType::LegislativeTerm, &body_id, None, &mut children),
                location: self.embedded_one(obj, "location", EntityType::Location, &body_id, None, &mut children),
            }),
            EntityType::Organization => EntityRecord::Organization(Organization {
                name: text(obj, "name"),
                short_name: text(obj, "shortName"),
                organization_type: text(obj, "organizationType"),
                classification: text(obj, "classification"),
                start_date: date(obj, "startDate"),
                end_date: date(obj, "endDate"),
                sub_organization_of: reference_field(obj, "subOrganizationOf"),
                location: self.embedded_one(obj, "location", EntityType::Location, &body_id, None, &mut children),
            }),
            EntityType::Person => EntityRecord::Person(Person {
                name: text(obj, "name"),
                family_name: text(obj, "familyName"),
                given_name: text(obj, "givenName"),
                title: text_list(obj, "title"),
                gender: text(obj, "gender"),
                status: text_list(obj, "status"),
                memberships: self.embedded_list(obj, "membership", EntityType::Membership, &body_id, Some(me("membership")), &mut children),
            }),
            EntityType::Membership => EntityRecord::Membership(Membership {
                person: reference_field(obj, "person").or_else(|| owned_by(owner, EntityType::Person)),
                organization: reference_field(obj, "organization"),
                role: text(obj, "role"),
                voting_right: flag(obj, "votingRight"),
                start_date: date(obj, "startDate"),
                end_date: date(obj, "endDate"),
            }),
            EntityType::Meeting => EntityRecord::Meeting(Meeting {
                name: text(obj, "name"),
                meeting_state: text(obj, "meetingState"),
                cancelled: flag(obj, "cancelled"),
                start: timestamp(obj, "start"),
                end: timestamp(obj, "end"),
                location: self.embedded_one(obj, "location", EntityType::Location, &body_id, None, &mut children),
                organizations: reference_list(obj, "organization"),
                agenda_items: self.embedded_list(obj, "agendaItem", EntityType::AgendaItem, &body_id, Some(me("agenda_item")), &mut children),
                invitation: self.embedded_one(obj, "invitation", EntityType::File, &body_id, Some(me("invitation")), &mut children),
                results_protocol: self.embedded_one(obj, "resultsProtocol", EntityType::File, &body_id, Some(me("results_protocol")), &mut children),
                verbatim_protocol: self.embedded_one(obj, "verbatimProtocol", EntityType::File, &body_id, Some(me("verbatim_protocol")), &mut children),
                auxiliary_files: self.embedded_list(obj, "auxiliaryFile", EntityType::File, &body_id, Some(me("auxiliary_file")), &mut children),
            }),
            EntityType::AgendaItem => EntityRecord::AgendaItem(AgendaItem {
                meeting: reference_field(obj, "meeting").or_else(|| owned_by(owner, EntityType::Meeting)),
                number: text(obj, "number"),
                order: integer(obj, "order"),
                name: text(obj, "name"),
                public: flag(obj, "public"),
                consultation: reference_field(obj, "consultation"),
                result: text(obj, "result"),
                resolution_text: text(obj, "resolutionText"),
            }),
            EntityType::Paper => EntityRecord::Paper(Paper {
                name: text(obj, "name"),
                reference: text(obj, "reference"),
                date: date(obj, "date"),
                paper_type: text(obj, "paperType"),
                main_file: self.embedded_one(obj, "mainFile", EntityType::File, &body_id, Some(me("main_file")), &mut children),
                auxiliary_files: self.embedded_list(obj, "auxiliaryFile", EntityType::File, &body_id, Some(me("auxiliary_file")), &mut children),
                consultations: self.embedded_list(obj, "consultation", EntityType::Consultation, &body_id, Some(me("consultation")), &mut children),
                related_papers: reference_list(obj, "relatedPaper"),
                under_direction_of: reference_list(obj, "underDirectionOf"),
                originator_persons: reference_list(obj, "originatorPerson"),
                originator_organizations: reference_list(obj, "originatorOrganization"),
                locations: self.embedded_list(obj, "location", EntityType::Location, &body_id, None, &mut children),
            }),
            EntityType::Consultation => EntityRecord::Consultation(Consultation {
                paper: reference_field(obj, "paper").or_else(|| owned_by(owner, EntityType::Paper)),
                agenda_item: reference_field(obj, "agendaItem"),
                meeting: reference_field(obj, "meeting"),
                organizations: reference_list(obj, "organization"),
                authoritative: flag(obj, "authoritative"),
                role: text(obj, "role"),
            }),
            EntityType::File => EntityRecord::File(File {
                name: text(obj, "name"),
                file_name: text(obj, "fileName"),
                mime_type: text(obj, "mimeType"),
                size: integer(obj, "size"),
                access_url: text(obj, "accessUrl"),
                download_url: text(obj, "downloadUrl"),
                date: date(obj, "date"),
                parent: owner
                    .filter(|o| matches!(o.entity_type, EntityType::Paper | EntityType::Meeting))
                    .map(|o| FileParent {
                        entity_type: o.entity_type,
                        external_id: o.external_id.to_string(),
                        role: o.role.to_string(),
                    }),
            }),
            EntityType::Location => EntityRecord::Location(Location {
                description: text(obj, "description"),
                street_address: text(obj, "streetAddress"),
                room: text(obj, "room"),
                postal_code: text(obj, "postalCode"),
                locality: text(obj, "locality"),
                geojson: obj.get("geojson").filter(|v| !is_empty_value(v)).cloned(),
            }),
            EntityType::LegislativeTerm => EntityRecord::LegislativeTerm(LegislativeTerm {
                name: text(obj, "name"),
                start_date: date(obj, "startDate"),
                end_date: date(obj, "endDate"),
            }),
        };

        out.push(NormalizedEntity {
            external_id: external_id.clone(),
            body_id,
            remote_modified,
            remote_created,
            deleted,
            record,
            raw_payload: raw.clone(),
        });
        out.extend(children);
        Ok(external_id)
    }

    /// Reference to a nested object. Embedded objects are normalized into `children`;
    /// bare URLs are kept as references only.
    fn embedded_one(
        &self,
        obj: &Object,
        key: &str,
        child_type: EntityType,
        body_id: &str,
        owner: Option<Owner<'_>>,
        children: &mut Vec<NormalizedEntity>,
    ) -> Option<String> {
        match obj.get(key)? {
            Value::Array(items) => items
                .iter()
                .find_map(|v| self.embedded_value(v, child_type, body_id, owner, children)),
            v => self.embedded_value(v, child_type, body_id, owner, children),
        }
    }

    fn embedded_list(
        &self,
        obj: &Object,
        key: &str,
        child_type: EntityType,
        body_id: &str,
        owner: Option<Owner<'_>>,
        children: &mut Vec<NormalizedEntity>,
    ) -> Vec<String> {
        match obj.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| self.embedded_value(v, child_type, body_id, owner, children))
                .collect(),
            Some(v) => self.embedded_value(v, child_type, body_id, owner, children).into_iter().collect(),
            None => Vec::new(),
        }
    }

    fn embedded_value(
        &self,
        value: &Value,
        child_type: EntityType,
        body_id: &str,
        owner: Option<Owner<'_>>,
        children: &mut Vec<NormalizedEntity>,
    ) -> Option<String> {
        match value {
            Value::Object(_) => {
                let mut nested = Vec::new();
                match self.entity(child_type, Some(body_id), value, owner, &mut nested) {
                    Ok(id) => {
                        children.extend(nested);
                        Some(id)
                    }
                    Err(e) => {
                        tracing::warn!(
                            entity_type = %child_type,
                            parent = owner.map(|o| o.external_id).unwrap_or(body_id),
                            error = %e,
                            "Skipping malformed embedded object"
                        );
                        None
                    }
                }
            }
            other => reference(other),
        }
    }
}

fn owned_by(owner: Option<Owner<'_>>, expected: EntityType) -> Option<String> {
    owner
        .filter(|o| o.entity_type == expected)
        .map(|o| o.external_id.to_string())
}
