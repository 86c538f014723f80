use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{
    AgreementStatus, ContactId, EnvelopeId, Money, Provider, SessionId, SessionStatus, UserId,
};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::records::decide_redemption;
use crate::{
    AgreementRecord, CheckoutSession, CompanyInfo, CompanyInfoFields, EventLedger,
    NewCheckoutSession, NewProcessedEvent, NewSignupLink, ProcessedEvent, RedemptionOutcome,
    Result, SalesOrder, SessionStore, SignupLink, SignupLinkStore, StoreError, User,
    ZohoAccountLink,
};

const SESSION_COLUMNS: &str =
    "id, user_id, status, module, card_last4, payment_reference, created_at, updated_at";
const COMPANY_COLUMNS: &str = "session_id, company_name, contact_name, email, phone, address, \
     city, state, zip_code, country, industry, company_size, created_at, updated_at";
const AGREEMENT_COLUMNS: &str =
    "session_id, provider, envelope_id, status, completed_at, created_at, updated_at";
const SALES_ORDER_COLUMNS: &str =
    "session_id, external_id, amount_cents, currency, created_at, updated_at";
const ACCOUNT_LINK_COLUMNS: &str = "user_id, contact_id, access_token, refresh_token, \
     token_expires_at, created_at, updated_at";
const SIGNUP_LINK_COLUMNS: &str = "contact_id, login_code, created_by, expires_at, max_uses, \
     usage_count, is_active, created_at";

/// PostgreSQL-backed session store.
///
/// Atomicity comes from the schema: unique constraints for the ledger and
/// the envelope binding, conditional `UPDATE ... WHERE status = $n` for
/// status changes, and a row lock for magic-link redemption.
#[derive(Clone)]
pub struct PostgresSessionStore {
    pool: PgPool,
}

impl PostgresSessionStore {
    /// Creates a new PostgreSQL session store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_user(row: PgRow) -> Result<User> {
        Ok(User {
            id: UserId::from_uuid(row.try_get::<Uuid, _>("id")?),
            email: row.try_get("email")?,
            name: row.try_get("name")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn row_to_session(row: PgRow) -> Result<CheckoutSession> {
        Ok(CheckoutSession {
            id: SessionId::from_uuid(row.try_get::<Uuid, _>("id")?),
            user_id: UserId::from_uuid(row.try_get::<Uuid, _>("user_id")?),
            status: row.try_get::<String, _>("status")?.parse()?,
            module: row.try_get("module")?,
            card_last4: row.try_get("card_last4")?,
            payment_reference: row.try_get("payment_reference")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_company_info(row: PgRow) -> Result<CompanyInfo> {
        Ok(CompanyInfo {
            session_id: SessionId::from_uuid(row.try_get::<Uuid, _>("session_id")?),
            fields: CompanyInfoFields {
                company_name: row.try_get("company_name")?,
                contact_name: row.try_get("contact_name")?,
                email: row.try_get("email")?,
                phone: row.try_get("phone")?,
                address: row.try_get("address")?,
                city: row.try_get("city")?,
                state: row.try_get("state")?,
                zip_code: row.try_get("zip_code")?,
                country: row.try_get("country")?,
                industry: row.try_get("industry")?,
                company_size: row.try_get("company_size")?,
            },
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_agreement(row: PgRow) -> Result<AgreementRecord> {
        Ok(AgreementRecord {
            session_id: SessionId::from_uuid(row.try_get::<Uuid, _>("session_id")?),
            provider: row.try_get("provider")?,
            envelope_id: EnvelopeId::new(row.try_get::<String, _>("envelope_id")?),
            status: row.try_get::<String, _>("status")?.parse()?,
            completed_at: row.try_get("completed_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_sales_order(row: PgRow) -> Result<SalesOrder> {
        Ok(SalesOrder {
            session_id: SessionId::from_uuid(row.try_get::<Uuid, _>("session_id")?),
            external_id: row.try_get("external_id")?,
            amount: Money::from_cents(row.try_get("amount_cents")?),
            currency: row.try_get("currency")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_account_link(row: PgRow) -> Result<ZohoAccountLink> {
        Ok(ZohoAccountLink {
            user_id: UserId::from_uuid(row.try_get::<Uuid, _>("user_id")?),
            contact_id: ContactId::new(row.try_get::<String, _>("contact_id")?),
            access_token: row.try_get("access_token")?,
            refresh_token: row.try_get("refresh_token")?,
            token_expires_at: row.try_get("token_expires_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_signup_link(row: PgRow) -> Result<SignupLink> {
        Ok(SignupLink {
            contact_id: ContactId::new(row.try_get::<String, _>("contact_id")?),
            login_code: row.try_get("login_code")?,
            created_by: UserId::from_uuid(row.try_get::<Uuid, _>("created_by")?),
            expires_at: row.try_get("expires_at")?,
            max_uses: to_u32("max_uses", row.try_get("max_uses")?)?,
            usage_count: to_u32("usage_count", row.try_get("usage_count")?)?,
            is_active: row.try_get("is_active")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn row_to_processed_event(row: PgRow) -> Result<ProcessedEvent> {
        Ok(ProcessedEvent {
            provider: row.try_get::<String, _>("provider")?.parse::<Provider>()?,
            external_event_id: row.try_get("external_event_id")?,
            event_kind: row.try_get("event_kind")?,
            received_at: row.try_get("received_at")?,
        })
    }

    async fn session_exists(&self, session_id: SessionId) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM checkout_sessions WHERE id = $1)")
                .bind(session_id.as_uuid())
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }
}

fn to_u32(column: &str, value: i32) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| StoreError::CorruptRecord(format!("negative {column}: {value}")))
}

fn to_i32(value: u32) -> Result<i32> {
    i32::try_from(value).map_err(|_| StoreError::Conflict(format!("value out of range: {value}")))
}

/// Maps a named unique-constraint violation to `Conflict`.
fn map_unique(err: sqlx::Error, constraint: &str, message: impl FnOnce() -> String) -> StoreError {
    if let sqlx::Error::Database(ref db_err) = err
        && db_err.constraint() == Some(constraint)
    {
        return StoreError::Conflict(message());
    }
    StoreError::Database(err)
}

#[async_trait]
impl SessionStore for PostgresSessionStore {
    async fn create_user(&self, email: &str, name: Option<&str>) -> Result<User> {
        let row = sqlx::query(
            r#"
            INSERT INTO users (id, email, name)
            VALUES ($1, $2, $3)
            RETURNING id, email, name, created_at
            "#,
        )
        .bind(UserId::new().as_uuid())
        .bind(email)
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            map_unique(e, "unique_user_email", || {
                format!("email already registered: {email}")
            })
        })?;

        Self::row_to_user(row)
    }

    async fn get_user(&self, user_id: UserId) -> Result<Option<User>> {
        sqlx::query("SELECT id, email, name, created_at FROM users WHERE id = $1")
            .bind(user_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .map(Self::row_to_user)
            .transpose()
    }

    async fn create_session(&self, new: NewCheckoutSession) -> Result<CheckoutSession> {
        let session_id = SessionId::new();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO checkout_sessions (id, user_id, status, module, payment_reference)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {SESSION_COLUMNS}
            "#
        ))
        .bind(session_id.as_uuid())
        .bind(new.user_id.as_uuid())
        .bind(SessionStatus::Pending.as_str())
        .bind(&new.module)
        .bind(&new.payment_reference)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            map_unique(e, "unique_payment_reference", || {
                format!(
                    "payment reference already bound: {}",
                    new.payment_reference.as_deref().unwrap_or_default()
                )
            })
        })?;

        sqlx::query(
            r#"
            INSERT INTO sales_orders (session_id, amount_cents, currency)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(session_id.as_uuid())
        .bind(new.amount.cents())
        .bind(&new.currency)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Self::row_to_session(row)
    }

    async fn get_session(&self, session_id: SessionId) -> Result<Option<CheckoutSession>> {
        sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM checkout_sessions WHERE id = $1"
        ))
        .bind(session_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .map(Self::row_to_session)
        .transpose()
    }

    async fn find_session_by_payment_reference(
        &self,
        reference: &str,
    ) -> Result<Option<CheckoutSession>> {
        sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM checkout_sessions WHERE payment_reference = $1"
        ))
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?
        .map(Self::row_to_session)
        .transpose()
    }

    async fn list_sessions_for_user(&self, user_id: UserId) -> Result<Vec<CheckoutSession>> {
        let rows = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM checkout_sessions WHERE user_id = $1 ORDER BY created_at DESC"
        ))
        .bind(user_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_session).collect()
    }

    async fn transition_session_status(
        &self,
        session_id: SessionId,
        expected: SessionStatus,
        next: SessionStatus,
    ) -> Result<CheckoutSession> {
        let updated = sqlx::query(&format!(
            r#"
            UPDATE checkout_sessions
            SET status = $3, updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING {SESSION_COLUMNS}
            "#
        ))
        .bind(session_id.as_uuid())
        .bind(expected.as_str())
        .bind(next.as_str())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = updated {
            return Self::row_to_session(row);
        }

        match self.get_session(session_id).await? {
            Some(current) => Err(StoreError::StaleStatus {
                entity: "checkout session",
                id: session_id.to_string(),
                expected: expected.to_string(),
                actual: current.status.to_string(),
            }),
            None => Err(StoreError::not_found("checkout session", session_id)),
        }
    }

    async fn record_card_summary(&self, session_id: SessionId, card_last4: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE checkout_sessions SET card_last4 = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(session_id.as_uuid())
        .bind(card_last4)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("checkout session", session_id));
        }
        Ok(())
    }

    async fn upsert_company_info(
        &self,
        session_id: SessionId,
        fields: CompanyInfoFields,
    ) -> Result<CompanyInfo> {
        if !self.session_exists(session_id).await? {
            return Err(StoreError::not_found("checkout session", session_id));
        }

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO company_infos (
                session_id, company_name, contact_name, email, phone, address,
                city, state, zip_code, country, industry, company_size
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (session_id) DO UPDATE SET
                company_name = EXCLUDED.company_name,
                contact_name = EXCLUDED.contact_name,
                email = EXCLUDED.email,
                phone = EXCLUDED.phone,
                address = EXCLUDED.address,
                city = EXCLUDED.city,
                state = EXCLUDED.state,
                zip_code = EXCLUDED.zip_code,
                country = EXCLUDED.country,
                industry = EXCLUDED.industry,
                company_size = EXCLUDED.company_size,
                updated_at = NOW()
            RETURNING {COMPANY_COLUMNS}
            "#
        ))
        .bind(session_id.as_uuid())
        .bind(&fields.company_name)
        .bind(&fields.contact_name)
        .bind(&fields.email)
        .bind(&fields.phone)
        .bind(&fields.address)
        .bind(&fields.city)
        .bind(&fields.state)
        .bind(&fields.zip_code)
        .bind(&fields.country)
        .bind(&fields.industry)
        .bind(&fields.company_size)
        .fetch_one(&self.pool)
        .await?;

        Self::row_to_company_info(row)
    }

    async fn get_company_info(&self, session_id: SessionId) -> Result<Option<CompanyInfo>> {
        sqlx::query(&format!(
            "SELECT {COMPANY_COLUMNS} FROM company_infos WHERE session_id = $1"
        ))
        .bind(session_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .map(Self::row_to_company_info)
        .transpose()
    }

    async fn upsert_agreement(
        &self,
        session_id: SessionId,
        provider: &str,
        envelope_id: &EnvelopeId,
    ) -> Result<AgreementRecord> {
        if !self.session_exists(session_id).await? {
            return Err(StoreError::not_found("checkout session", session_id));
        }

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO agreements (session_id, provider, envelope_id, status)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (session_id) DO UPDATE SET
                provider = EXCLUDED.provider,
                envelope_id = EXCLUDED.envelope_id,
                status = EXCLUDED.status,
                completed_at = NULL,
                updated_at = NOW()
            RETURNING {AGREEMENT_COLUMNS}
            "#
        ))
        .bind(session_id.as_uuid())
        .bind(provider)
        .bind(envelope_id.as_str())
        .bind(AgreementStatus::Pending.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            map_unique(e, "unique_envelope_id", || {
                format!("envelope already bound to another session: {envelope_id}")
            })
        })?;

        Self::row_to_agreement(row)
    }

    async fn get_agreement_by_envelope(
        &self,
        envelope_id: &EnvelopeId,
    ) -> Result<Option<AgreementRecord>> {
        sqlx::query(&format!(
            "SELECT {AGREEMENT_COLUMNS} FROM agreements WHERE envelope_id = $1"
        ))
        .bind(envelope_id.as_str())
        .fetch_optional(&self.pool)
        .await?
        .map(Self::row_to_agreement)
        .transpose()
    }

    async fn get_agreement_for_session(
        &self,
        session_id: SessionId,
    ) -> Result<Option<AgreementRecord>> {
        sqlx::query(&format!(
            "SELECT {AGREEMENT_COLUMNS} FROM agreements WHERE session_id = $1"
        ))
        .bind(session_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .map(Self::row_to_agreement)
        .transpose()
    }

    async fn transition_agreement_status(
        &self,
        envelope_id: &EnvelopeId,
        expected: AgreementStatus,
        next: AgreementStatus,
        at: DateTime<Utc>,
    ) -> Result<AgreementRecord> {
        let updated = sqlx::query(&format!(
            r#"
            UPDATE agreements
            SET status = $3,
                completed_at = CASE
                    WHEN $3 = 'completed' THEN COALESCE(completed_at, $4)
                    ELSE completed_at
                END,
                updated_at = $4
            WHERE envelope_id = $1 AND status = $2
            RETURNING {AGREEMENT_COLUMNS}
            "#
        ))
        .bind(envelope_id.as_str())
        .bind(expected.as_str())
        .bind(next.as_str())
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = updated {
            return Self::row_to_agreement(row);
        }

        match self.get_agreement_by_envelope(envelope_id).await? {
            Some(current) => Err(StoreError::StaleStatus {
                entity: "agreement",
                id: envelope_id.to_string(),
                expected: expected.to_string(),
                actual: current.status.to_string(),
            }),
            None => Err(StoreError::not_found("agreement", envelope_id)),
        }
    }

    async fn get_sales_order(&self, session_id: SessionId) -> Result<Option<SalesOrder>> {
        sqlx::query(&format!(
            "SELECT {SALES_ORDER_COLUMNS} FROM sales_orders WHERE session_id = $1"
        ))
        .bind(session_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .map(Self::row_to_sales_order)
        .transpose()
    }

    async fn set_sales_order_external_id(
        &self,
        session_id: SessionId,
        external_id: &str,
    ) -> Result<SalesOrder> {
        let updated = sqlx::query(&format!(
            r#"
            UPDATE sales_orders
            SET external_id = $2, updated_at = NOW()
            WHERE session_id = $1 AND external_id IS NULL
            RETURNING {SALES_ORDER_COLUMNS}
            "#
        ))
        .bind(session_id.as_uuid())
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = updated {
            return Self::row_to_sales_order(row);
        }

        let current = self
            .get_sales_order(session_id)
            .await?
            .ok_or_else(|| StoreError::not_found("sales order", session_id))?;

        match current.external_id.as_deref() {
            Some(existing) if existing == external_id => Ok(current),
            Some(existing) => Err(StoreError::Conflict(format!(
                "sales order for {session_id} already provisioned as {existing}"
            ))),
            None => Err(StoreError::Conflict(format!(
                "sales order for {session_id} changed concurrently"
            ))),
        }
    }

    async fn get_account_link(&self, user_id: UserId) -> Result<Option<ZohoAccountLink>> {
        sqlx::query(&format!(
            "SELECT {ACCOUNT_LINK_COLUMNS} FROM zoho_account_links WHERE user_id = $1"
        ))
        .bind(user_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .map(Self::row_to_account_link)
        .transpose()
    }

    async fn upsert_account_link(
        &self,
        user_id: UserId,
        contact_id: &ContactId,
    ) -> Result<ZohoAccountLink> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO zoho_account_links (user_id, contact_id)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO UPDATE SET
                contact_id = EXCLUDED.contact_id,
                updated_at = NOW()
            RETURNING {ACCOUNT_LINK_COLUMNS}
            "#
        ))
        .bind(user_id.as_uuid())
        .bind(contact_id.as_str())
        .fetch_one(&self.pool)
        .await?;

        Self::row_to_account_link(row)
    }

    async fn record_step_attempt(&self, session_id: SessionId, step: &str) -> Result<u32> {
        let attempts: i32 = sqlx::query_scalar(
            r#"
            INSERT INTO provisioning_attempts (session_id, step, attempts)
            VALUES ($1, $2, 1)
            ON CONFLICT (session_id, step) DO UPDATE SET
                attempts = provisioning_attempts.attempts + 1,
                last_attempt_at = NOW()
            RETURNING attempts
            "#,
        )
        .bind(session_id.as_uuid())
        .bind(step)
        .fetch_one(&self.pool)
        .await?;

        to_u32("attempts", attempts)
    }

    async fn try_acquire_provisioning_lease(
        &self,
        session_id: SessionId,
        holder: &str,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<bool> {
        let acquired = sqlx::query(
            r#"
            UPDATE checkout_sessions
            SET lease_holder = $2, lease_until = $4
            WHERE id = $1
              AND (lease_holder IS NULL OR lease_holder = $2 OR lease_until <= $3)
            "#,
        )
        .bind(session_id.as_uuid())
        .bind(holder)
        .bind(now)
        .bind(until)
        .execute(&self.pool)
        .await?
        .rows_affected()
            == 1;

        if !acquired && !self.session_exists(session_id).await? {
            return Err(StoreError::not_found("checkout session", session_id));
        }

        tracing::debug!(session_id = %session_id, holder, acquired, "provisioning lease");
        Ok(acquired)
    }

    async fn release_provisioning_lease(&self, session_id: SessionId, holder: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE checkout_sessions
            SET lease_holder = NULL, lease_until = NULL
            WHERE id = $1 AND lease_holder = $2
            "#,
        )
        .bind(session_id.as_uuid())
        .bind(holder)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl EventLedger for PostgresSessionStore {
    async fn record_processed_event(&self, event: NewProcessedEvent) -> Result<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO processed_events (provider, external_event_id, event_kind)
            VALUES ($1, $2, $3)
            ON CONFLICT (provider, external_event_id) DO NOTHING
            "#,
        )
        .bind(event.provider.as_str())
        .bind(&event.external_event_id)
        .bind(&event.event_kind)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(inserted == 1)
    }

    async fn get_processed_event(
        &self,
        provider: Provider,
        external_event_id: &str,
    ) -> Result<Option<ProcessedEvent>> {
        sqlx::query(
            r#"
            SELECT provider, external_event_id, event_kind, received_at
            FROM processed_events
            WHERE provider = $1 AND external_event_id = $2
            "#,
        )
        .bind(provider.as_str())
        .bind(external_event_id)
        .fetch_optional(&self.pool)
        .await?
        .map(Self::row_to_processed_event)
        .transpose()
    }

    async fn forget_processed_event(
        &self,
        provider: Provider,
        external_event_id: &str,
    ) -> Result<()> {
        sqlx::query("DELETE FROM processed_events WHERE provider = $1 AND external_event_id = $2")
            .bind(provider.as_str())
            .bind(external_event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SignupLinkStore for PostgresSessionStore {
    async fn create_signup_link(&self, new: NewSignupLink) -> Result<SignupLink> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO signup_links (contact_id, login_code, created_by, expires_at, max_uses)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {SIGNUP_LINK_COLUMNS}
            "#
        ))
        .bind(new.contact_id.as_str())
        .bind(&new.login_code)
        .bind(new.created_by.as_uuid())
        .bind(new.expires_at)
        .bind(to_i32(new.max_uses)?)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_unique(e, "signup_links_pkey", || "login code collision".to_string()))?;

        Self::row_to_signup_link(row)
    }

    async fn get_signup_link(
        &self,
        contact_id: &ContactId,
        login_code: &str,
    ) -> Result<Option<SignupLink>> {
        sqlx::query(&format!(
            "SELECT {SIGNUP_LINK_COLUMNS} FROM signup_links WHERE contact_id = $1 AND login_code = $2"
        ))
        .bind(contact_id.as_str())
        .bind(login_code)
        .fetch_optional(&self.pool)
        .await?
        .map(Self::row_to_signup_link)
        .transpose()
    }

    async fn redeem_signup_link(
        &self,
        contact_id: &ContactId,
        login_code: &str,
        now: DateTime<Utc>,
    ) -> Result<RedemptionOutcome> {
        let mut tx = self.pool.begin().await?;

        // Row lock serializes concurrent redemptions of the same code
        let row = sqlx::query(&format!(
            r#"
            SELECT {SIGNUP_LINK_COLUMNS} FROM signup_links
            WHERE contact_id = $1 AND login_code = $2
            FOR UPDATE
            "#
        ))
        .bind(contact_id.as_str())
        .bind(login_code)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(RedemptionOutcome::NotFound);
        };
        let link = Self::row_to_signup_link(row)?;

        let (outcome, write) = decide_redemption(&link, now);
        if let Some(updated) = write {
            sqlx::query(
                r#"
                UPDATE signup_links
                SET usage_count = $3, is_active = $4
                WHERE contact_id = $1 AND login_code = $2
                "#,
            )
            .bind(contact_id.as_str())
            .bind(login_code)
            .bind(to_i32(updated.usage_count)?)
            .bind(updated.is_active)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(outcome)
    }
}
