//! CRM collaborator: contacts, sales orders and related-record search.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::{ContactId, Money, SessionId};
use serde::{Deserialize, Serialize};
use session_store::{CompanyInfoFields, User};

use super::{InjectedFailure, lock};
use crate::ProviderCallError;

pub const OP_GET_CONTACT: &str = "crm.get_contact";
pub const OP_CREATE_CONTACT: &str = "crm.create_contact";
pub const OP_UPDATE_CONTACT: &str = "crm.update_contact";
pub const OP_CREATE_SALES_ORDER: &str = "crm.create_sales_order";
pub const OP_SEARCH_RELATED: &str = "crm.search_related";

/// Contact fields in the CRM's own naming.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactFields {
    #[serde(rename = "First_Name", skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(rename = "Last_Name")]
    pub last_name: String,
    #[serde(rename = "Email")]
    pub email: String,
    #[serde(rename = "Phone", skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(rename = "Company", skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(rename = "Mailing_Street", skip_serializing_if = "Option::is_none")]
    pub mailing_street: Option<String>,
    #[serde(rename = "Mailing_City", skip_serializing_if = "Option::is_none")]
    pub mailing_city: Option<String>,
    #[serde(rename = "Mailing_State", skip_serializing_if = "Option::is_none")]
    pub mailing_state: Option<String>,
    #[serde(rename = "Mailing_Zip", skip_serializing_if = "Option::is_none")]
    pub mailing_zip: Option<String>,
    #[serde(rename = "Mailing_Country")]
    pub mailing_country: String,
    #[serde(rename = "Industry", skip_serializing_if = "Option::is_none")]
    pub industry: Option<String>,
    #[serde(rename = "Description", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "Lead_Source", skip_serializing_if = "Option::is_none")]
    pub lead_source: Option<String>,
}

impl ContactFields {
    /// Builds the contact for a session's owner from its company profile.
    ///
    /// The contact name splits on the first space; a single word fills
    /// both name fields. The profile e-mail wins over the account e-mail.
    pub fn for_session(session_id: SessionId, info: &CompanyInfoFields, user: &User) -> Self {
        let mut parts = info.contact_name.split_whitespace();
        let first = parts.next().map(str::to_string);
        let rest = parts.collect::<Vec<_>>().join(" ");
        let last_name = if rest.is_empty() {
            first
                .clone()
                .or_else(|| user.name.clone())
                .unwrap_or_else(|| user.email.clone())
        } else {
            rest
        };

        Self {
            first_name: first,
            last_name,
            email: info.email.clone().unwrap_or_else(|| user.email.clone()),
            phone: info.phone.clone(),
            company: Some(info.company_name.clone()),
            mailing_street: info.address.clone(),
            mailing_city: info.city.clone(),
            mailing_state: info.state.clone(),
            mailing_zip: info.zip_code.clone(),
            mailing_country: info.country.clone().unwrap_or_else(|| "US".to_string()),
            industry: info.industry.clone(),
            description: Some(format!("Created via checkout session: {session_id}")),
            lead_source: Some("Website Checkout".to_string()),
        }
    }
}

/// A contact as the CRM returns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrmContact {
    pub id: ContactId,
    #[serde(flatten)]
    pub fields: ContactFields,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SalesOrderLine {
    pub product_name: String,
    pub quantity: u32,
    pub list_price: Money,
}

/// A sales order to create against a contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SalesOrderRequest {
    pub contact_id: ContactId,
    pub subject: String,
    pub deal_name: String,
    pub grand_total: Money,
    pub currency: String,
    pub status: String,
    pub description: String,
    pub line_items: Vec<SalesOrderLine>,
}

impl SalesOrderRequest {
    /// Draft order for one checkout session: a single line for the module.
    pub fn for_session(
        session_id: SessionId,
        module: Option<&str>,
        contact_id: ContactId,
        amount: Money,
        currency: &str,
    ) -> Self {
        let module = module.unwrap_or("Zoho Integration");
        Self {
            contact_id,
            subject: format!("{module} - {session_id}"),
            deal_name: format!("{module} Deal"),
            grand_total: amount,
            currency: currency.to_string(),
            status: "Draft".to_string(),
            description: format!("Sales order created from checkout session: {session_id}"),
            line_items: vec![SalesOrderLine {
                product_name: module.to_string(),
                quantity: 1,
                list_price: amount,
            }],
        }
    }
}

/// Record types reachable from a contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelatedModule {
    SalesOrders,
    Deals,
    Tasks,
    Notes,
}

impl RelatedModule {
    pub fn api_name(&self) -> &'static str {
        match self {
            RelatedModule::SalesOrders => "Sales_Orders",
            RelatedModule::Deals => "Deals",
            RelatedModule::Tasks => "Tasks",
            RelatedModule::Notes => "Notes",
        }
    }

    /// Search criteria selecting this module's records for `contact`.
    pub fn criteria(&self, contact: &ContactId) -> String {
        let field = match self {
            RelatedModule::SalesOrders | RelatedModule::Deals => "Contact_Name",
            RelatedModule::Tasks => "Who_Id",
            RelatedModule::Notes => "Parent_Id",
        };
        format!("({field}:equals:{contact})")
    }
}

/// Capability interface onto the CRM.
#[async_trait]
pub trait CrmService: Send + Sync {
    /// Fetches a contact; `None` if the CRM has no such contact.
    async fn get_contact(&self, id: &ContactId) -> Result<Option<CrmContact>, ProviderCallError>;

    async fn create_contact(&self, fields: ContactFields) -> Result<ContactId, ProviderCallError>;

    async fn update_contact(
        &self,
        id: &ContactId,
        fields: ContactFields,
    ) -> Result<(), ProviderCallError>;

    /// Creates a sales order and returns the CRM's id for it.
    async fn create_sales_order(
        &self,
        request: SalesOrderRequest,
    ) -> Result<String, ProviderCallError>;

    async fn search_related(
        &self,
        module: RelatedModule,
        criteria: &str,
    ) -> Result<Vec<serde_json::Value>, ProviderCallError>;
}

#[derive(Debug, Default)]
struct InMemoryCrmState {
    contacts: HashMap<ContactId, ContactFields>,
    sales_orders: Vec<(String, SalesOrderRequest)>,
    related: HashMap<(RelatedModule, String), Vec<serde_json::Value>>,
    contacts_created: usize,
    contact_updates: usize,
    next_id: u32,
    failures: HashMap<&'static str, InjectedFailure>,
}

/// In-memory CRM for tests and the default server.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCrmService {
    state: Arc<Mutex<InMemoryCrmState>>,
}

impl InMemoryCrmService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `operation` fail until cleared with `None`.
    pub fn set_failure(&self, operation: &'static str, failure: Option<InjectedFailure>) {
        let mut state = lock(&self.state);
        match failure {
            Some(failure) => state.failures.insert(operation, failure),
            None => state.failures.remove(operation),
        };
    }

    /// Number of `create_contact` calls that created a contact.
    pub fn contacts_created(&self) -> usize {
        lock(&self.state).contacts_created
    }

    pub fn contact_updates(&self) -> usize {
        lock(&self.state).contact_updates
    }

    pub fn sales_order_count(&self) -> usize {
        lock(&self.state).sales_orders.len()
    }

    pub fn sales_orders(&self) -> Vec<(String, SalesOrderRequest)> {
        lock(&self.state).sales_orders.clone()
    }

    /// Seeds a contact with a known id.
    pub fn insert_contact(&self, id: ContactId, fields: ContactFields) {
        lock(&self.state).contacts.insert(id, fields);
    }

    /// Seeds a related record for `contact`.
    pub fn add_related(&self, module: RelatedModule, contact: &ContactId, record: serde_json::Value) {
        lock(&self.state)
            .related
            .entry((module, module.criteria(contact)))
            .or_default()
            .push(record);
    }

    async fn check(&self, operation: &'static str) -> Result<(), ProviderCallError> {
        let failure = lock(&self.state).failures.get(operation).cloned();
        match failure {
            Some(failure) => failure.apply(operation).await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CrmService for InMemoryCrmService {
    async fn get_contact(&self, id: &ContactId) -> Result<Option<CrmContact>, ProviderCallError> {
        self.check(OP_GET_CONTACT).await?;
        Ok(lock(&self.state).contacts.get(id).map(|fields| CrmContact {
            id: id.clone(),
            fields: fields.clone(),
        }))
    }

    async fn create_contact(&self, fields: ContactFields) -> Result<ContactId, ProviderCallError> {
        self.check(OP_CREATE_CONTACT).await?;
        let mut state = lock(&self.state);
        state.next_id += 1;
        let id = ContactId::new(format!("zcrm-contact-{:04}", state.next_id));
        state.contacts.insert(id.clone(), fields);
        state.contacts_created += 1;
        Ok(id)
    }

    async fn update_contact(
        &self,
        id: &ContactId,
        fields: ContactFields,
    ) -> Result<(), ProviderCallError> {
        self.check(OP_UPDATE_CONTACT).await?;
        let mut state = lock(&self.state);
        let Some(existing) = state.contacts.get_mut(id) else {
            return Err(ProviderCallError::Rejected {
                operation: OP_UPDATE_CONTACT,
                reason: format!("no contact {id}"),
            });
        };
        *existing = fields;
        state.contact_updates += 1;
        Ok(())
    }

    async fn create_sales_order(
        &self,
        request: SalesOrderRequest,
    ) -> Result<String, ProviderCallError> {
        self.check(OP_CREATE_SALES_ORDER).await?;
        let mut state = lock(&self.state);
        if !state.contacts.contains_key(&request.contact_id) {
            return Err(ProviderCallError::Rejected {
                operation: OP_CREATE_SALES_ORDER,
                reason: format!("no contact {}", request.contact_id),
            });
        }
        state.next_id += 1;
        let id = format!("zcrm-so-{:04}", state.next_id);
        let criteria = RelatedModule::SalesOrders.criteria(&request.contact_id);
        state
            .related
            .entry((RelatedModule::SalesOrders, criteria))
            .or_default()
            .push(serde_json::json!({
                "id": id.clone(),
                "Subject": request.subject.clone(),
                "Grand_Total": request.grand_total.as_decimal(),
                "Status": request.status.clone(),
            }));
        state.sales_orders.push((id.clone(), request));
        Ok(id)
    }

    async fn search_related(
        &self,
        module: RelatedModule,
        criteria: &str,
    ) -> Result<Vec<serde_json::Value>, ProviderCallError> {
        self.check(OP_SEARCH_RELATED).await?;
        Ok(lock(&self.state)
            .related
            .get(&(module, criteria.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::UserId;

    fn user() -> User {
        User {
            id: UserId::new(),
            email: "ada@example.com".to_string(),
            name: Some("Ada".to_string()),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_contact_fields_split_name_and_default_country() {
        let info = CompanyInfoFields {
            company_name: "Acme".to_string(),
            contact_name: "Ada King Lovelace".to_string(),
            ..Default::default()
        };
        let session_id = SessionId::new();
        let fields = ContactFields::for_session(session_id, &info, &user());

        assert_eq!(fields.first_name.as_deref(), Some("Ada"));
        assert_eq!(fields.last_name, "King Lovelace");
        assert_eq!(fields.email, "ada@example.com");
        assert_eq!(fields.mailing_country, "US");
        assert_eq!(
            fields.description,
            Some(format!("Created via checkout session: {session_id}"))
        );
    }

    #[test]
    fn test_single_word_contact_name() {
        let info = CompanyInfoFields {
            company_name: "Acme".to_string(),
            contact_name: "Ada".to_string(),
            email: Some("ops@acme.test".to_string()),
            ..Default::default()
        };
        let fields = ContactFields::for_session(SessionId::new(), &info, &user());
        assert_eq!(fields.last_name, "Ada");
        assert_eq!(fields.email, "ops@acme.test");
    }

    #[test]
    fn test_contact_serializes_with_crm_names() {
        let contact = CrmContact {
            id: ContactId::new("c-1"),
            fields: ContactFields {
                last_name: "Lovelace".to_string(),
                email: "ada@example.com".to_string(),
                mailing_country: "US".to_string(),
                ..Default::default()
            },
        };
        let json = serde_json::to_value(&contact).unwrap();
        assert_eq!(json["id"], "c-1");
        assert_eq!(json["Last_Name"], "Lovelace");
        assert!(json.get("First_Name").is_none());
    }

    #[test]
    fn test_related_criteria() {
        let contact = ContactId::new("42");
        assert_eq!(RelatedModule::SalesOrders.criteria(&contact), "(Contact_Name:equals:42)");
        assert_eq!(RelatedModule::Tasks.criteria(&contact), "(Who_Id:equals:42)");
        assert_eq!(RelatedModule::Notes.criteria(&contact), "(Parent_Id:equals:42)");
    }

    #[tokio::test]
    async fn test_sales_order_requires_contact() {
        let crm = InMemoryCrmService::new();
        let request = SalesOrderRequest::for_session(
            SessionId::new(),
            None,
            ContactId::new("missing"),
            Money::from_cents(100),
            "USD",
        );
        assert!(matches!(
            crm.create_sales_order(request).await,
            Err(ProviderCallError::Rejected { .. })
        ));
    }

    #[tokio::test]
    async fn test_injected_failure_until_cleared() {
        let crm = InMemoryCrmService::new();
        crm.set_failure(
            OP_CREATE_CONTACT,
            Some(InjectedFailure::Unavailable("503".to_string())),
        );
        assert!(crm.create_contact(ContactFields::default()).await.is_err());
        assert_eq!(crm.contacts_created(), 0);

        crm.set_failure(OP_CREATE_CONTACT, None);
        let id = crm.create_contact(ContactFields::default()).await.unwrap();
        assert!(crm.get_contact(&id).await.unwrap().is_some());
        assert_eq!(crm.contacts_created(), 1);
    }

    #[tokio::test]
    async fn test_search_related_returns_seeded_records() {
        let crm = InMemoryCrmService::new();
        let contact = ContactId::new("c-1");
        crm.add_related(RelatedModule::Deals, &contact, serde_json::json!({"id": "d-1"}));

        let deals = crm
            .search_related(RelatedModule::Deals, &RelatedModule::Deals.criteria(&contact))
            .await
            .unwrap();
        assert_eq!(deals.len(), 1);

        let notes = crm
            .search_related(RelatedModule::Notes, &RelatedModule::Notes.criteria(&contact))
            .await
            .unwrap();
        assert!(notes.is_empty());
    }
}
