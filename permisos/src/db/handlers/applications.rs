//! Database repository for permit applications.
//!
//! Status is never written by `create`/`update`. [`Applications::apply_status`] is the only
//! statement that changes it, and it is only called from
//! [`crate::permits::transitions`], which checks the transition table first.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::instrument;

use crate::db::{
    errors::{DbError, Result},
    handlers::repository::Repository,
    models::applications::{
        ApplicationCreateDBRequest, ApplicationDBResponse, ApplicationFilter, ApplicationUpdateDBRequest, PaymentReferenceUpdate,
        PermitDocumentUpdate, StatusCount,
    },
};
use crate::permits::status::ApplicationStatus;
use crate::types::{ApplicationId, Operation, abbrev_uuid};

const APPLICATION_COLUMNS: &str = r#"
    id, user_id, status,
    applicant_name, curp_rfc, address,
    make, model, color, vin, engine_number, model_year,
    payment_method, amount, currency, payment_reference, oxxo_reference, oxxo_expires_at,
    folio, permit_file_path, valid_from, valid_until,
    renewed_from_id, renewal_reason, admin_notes,
    payment_initiated_at, payment_verified_at, payment_failed_at,
    permit_generation_started_at, permit_generated_at,
    completed_at, cancelled_at, expired_at, renewal_decided_at,
    created_at, updated_at
"#;

const FILTER_CLAUSE: &str = r#"
    WHERE ($1::uuid IS NULL OR user_id = $1)
      AND ($2::application_status IS NULL OR status = $2)
      AND ($3::text IS NULL
           OR applicant_name ILIKE '%' || $3 || '%'
           OR vin ILIKE '%' || $3 || '%'
           OR folio ILIKE '%' || $3 || '%')
"#;

pub struct Applications<'c> {
    db: &'c mut PgConnection,
}

#[async_trait::async_trait]
impl<'c> Repository for Applications<'c> {
    type New = ApplicationCreateDBRequest;
    type Patch = ApplicationUpdateDBRequest;
    type Record = ApplicationDBResponse;
    type Id = ApplicationId;
    type Filter = ApplicationFilter;

    #[instrument(skip(self, request), fields(user_id = %abbrev_uuid(&request.user_id), method = ?request.payment_method), err)]
    async fn create(&mut self, request: &Self::New) -> Result<Self::Record> {
        let d = &request.details;
        let application = sqlx::query_as::<_, ApplicationDBResponse>(&format!(
            r#"
            INSERT INTO permit_applications (
                user_id, status, applicant_name, curp_rfc, address,
                make, model, color, vin, engine_number, model_year,
                payment_method, amount, currency, renewed_from_id, renewal_reason
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            RETURNING {APPLICATION_COLUMNS}
            "#
        ))
        .bind(request.user_id)
        .bind(request.initial_status())
        .bind(d.applicant_name.trim())
        .bind(d.curp_rfc.trim().to_uppercase())
        .bind(d.address.trim())
        .bind(d.make.trim())
        .bind(d.model.trim())
        .bind(d.color.trim())
        .bind(d.vin.trim().to_uppercase())
        .bind(d.engine_number.trim())
        .bind(d.model_year)
        .bind(request.payment_method)
        .bind(request.amount)
        .bind(&request.currency)
        .bind(request.renewed_from_id)
        .bind(request.renewal_reason.as_deref())
        .fetch_one(&mut *self.db)
        .await?;

        Ok(application)
    }

    #[instrument(skip(self), fields(application_id = %abbrev_uuid(&id)), err)]
    async fn get_by_id(&mut self, id: Self::Id) -> Result<Option<Self::Record>> {
        let application =
            sqlx::query_as::<_, ApplicationDBResponse>(&format!("SELECT {APPLICATION_COLUMNS} FROM permit_applications WHERE id = $1"))
                .bind(id)
                .fetch_optional(&mut *self.db)
                .await?;

        Ok(application)
    }

    #[instrument(skip(self, filter), fields(limit = filter.limit, skip = filter.skip, status = ?filter.status), err)]
    async fn list(&mut self, filter: &Self::Filter) -> Result<Vec<Self::Record>> {
        let applications = sqlx::query_as::<_, ApplicationDBResponse>(&format!(
            "SELECT {APPLICATION_COLUMNS} FROM permit_applications {FILTER_CLAUSE} ORDER BY created_at DESC, id LIMIT $4 OFFSET $5"
        ))
        .bind(filter.user_id)
        .bind(filter.status)
        .bind(filter.search.as_deref())
        .bind(filter.limit)
        .bind(filter.skip)
        .fetch_all(&mut *self.db)
        .await?;

        Ok(applications)
    }

    #[instrument(skip(self, filter), err)]
    async fn count(&mut self, filter: &Self::Filter) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM permit_applications {FILTER_CLAUSE}"))
            .bind(filter.user_id)
            .bind(filter.status)
            .bind(filter.search.as_deref())
            .fetch_one(&mut *self.db)
            .await?;

        Ok(count)
    }

    /// Update applicant and vehicle fields. Only allowed while the status is editable.
    #[instrument(skip(self, request), fields(application_id = %abbrev_uuid(&id)), err)]
    async fn update(&mut self, id: Self::Id, request: &Self::Patch) -> Result<Self::Record> {
        let editable: Vec<ApplicationStatus> = ApplicationStatus::ALL.into_iter().filter(|s| s.is_editable()).collect();

        let updated = sqlx::query_as::<_, ApplicationDBResponse>(&format!(
            r#"
            UPDATE permit_applications SET
                applicant_name = COALESCE($2, applicant_name),
                curp_rfc = COALESCE(UPPER($3), curp_rfc),
                address = COALESCE($4, address),
                make = COALESCE($5, make),
                model = COALESCE($6, model),
                color = COALESCE($7, color),
                vin = COALESCE(UPPER($8), vin),
                engine_number = COALESCE($9, engine_number),
                model_year = COALESCE($10, model_year),
                admin_notes = COALESCE($11, admin_notes),
                updated_at = NOW()
            WHERE id = $1 AND status = ANY($12)
            RETURNING {APPLICATION_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(request.applicant_name.as_deref().map(str::trim))
        .bind(request.curp_rfc.as_deref().map(str::trim))
        .bind(request.address.as_deref().map(str::trim))
        .bind(request.make.as_deref().map(str::trim))
        .bind(request.model.as_deref().map(str::trim))
        .bind(request.color.as_deref().map(str::trim))
        .bind(request.vin.as_deref().map(str::trim))
        .bind(request.engine_number.as_deref().map(str::trim))
        .bind(request.model_year)
        .bind(request.admin_notes.as_deref())
        .bind(&editable)
        .fetch_optional(&mut *self.db)
        .await?;

        match updated {
            Some(application) => Ok(application),
            None => match self.get_by_id(id).await? {
                None => Err(DbError::NotFound),
                Some(current) => Err(DbError::ProtectedEntity {
                    operation: Operation::UpdateAll,
                    reason: format!("application details cannot change in status {}", current.status),
                    entity_type: "permit_application".to_string(),
                    entity_id: Some(id.to_string()),
                }),
            },
        }
    }
}

impl<'c> Applications<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Load and row-lock an application for the rest of the surrounding transaction.
    #[instrument(skip(self), fields(application_id = %abbrev_uuid(&id)), err)]
    pub async fn get_for_update(&mut self, id: ApplicationId) -> Result<Option<ApplicationDBResponse>> {
        let application = sqlx::query_as::<_, ApplicationDBResponse>(&format!(
            "SELECT {APPLICATION_COLUMNS} FROM permit_applications WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(application)
    }

    /// Move `id` from `from` to `to`, stamping the milestone column for `to`.
    ///
    /// Returns `None` if the row is no longer in `from`, so a concurrent change is never
    /// overwritten.
    #[instrument(skip(self), fields(application_id = %abbrev_uuid(&id), %from, %to), err)]
    pub async fn apply_status(
        &mut self,
        id: ApplicationId,
        from: ApplicationStatus,
        to: ApplicationStatus,
    ) -> Result<Option<ApplicationDBResponse>> {
        // Column names come from a closed enum, never from input
        let milestone = to
            .milestone()
            .map(|m| format!(", {} = NOW()", m.column()))
            .unwrap_or_default();

        let application = sqlx::query_as::<_, ApplicationDBResponse>(&format!(
            r#"
            UPDATE permit_applications
            SET status = $3, updated_at = NOW(){milestone}
            WHERE id = $1 AND status = $2
            RETURNING {APPLICATION_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(from)
        .bind(to)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(application)
    }

    #[instrument(skip(self, update), fields(application_id = %abbrev_uuid(&id), reference = %update.payment_reference), err)]
    pub async fn set_payment_reference(&mut self, id: ApplicationId, update: &PaymentReferenceUpdate) -> Result<ApplicationDBResponse> {
        let application = sqlx::query_as::<_, ApplicationDBResponse>(&format!(
            r#"
            UPDATE permit_applications SET
                payment_method = $2,
                payment_reference = $3,
                oxxo_reference = $4,
                oxxo_expires_at = $5,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {APPLICATION_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(update.payment_method)
        .bind(&update.payment_reference)
        .bind(update.oxxo_reference.as_deref())
        .bind(update.oxxo_expires_at)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)?;

        Ok(application)
    }

    #[instrument(skip(self), err)]
    pub async fn find_by_payment_reference(&mut self, reference: &str) -> Result<Option<ApplicationDBResponse>> {
        let application = sqlx::query_as::<_, ApplicationDBResponse>(&format!(
            "SELECT {APPLICATION_COLUMNS} FROM permit_applications WHERE payment_reference = $1"
        ))
        .bind(reference)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(application)
    }

    /// Record the generated document, but only while `claimed_at` still owns the generation.
    ///
    /// `None` means another issuer took the application over (or it left GENERATING_PERMIT).
    #[instrument(skip(self, update), fields(application_id = %abbrev_uuid(&id), folio = %update.folio), err)]
    pub async fn set_permit_document(
        &mut self,
        id: ApplicationId,
        claimed_at: DateTime<Utc>,
        update: &PermitDocumentUpdate,
    ) -> Result<Option<ApplicationDBResponse>> {
        let application = sqlx::query_as::<_, ApplicationDBResponse>(&format!(
            r#"
            UPDATE permit_applications SET
                folio = $2,
                permit_file_path = $3,
                valid_from = $4,
                valid_until = $5,
                updated_at = NOW()
            WHERE id = $1
              AND status = 'GENERATING_PERMIT'
              AND permit_generation_started_at = $6
            RETURNING {APPLICATION_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&update.folio)
        .bind(&update.permit_file_path)
        .bind(update.valid_from)
        .bind(update.valid_until)
        .bind(claimed_at)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(application)
    }

    /// Store `folio` unless the application already has one. Returns the application as saved.
    #[instrument(skip(self), fields(application_id = %abbrev_uuid(&id)), err)]
    pub async fn reserve_folio(&mut self, id: ApplicationId, folio: &str) -> Result<ApplicationDBResponse> {
        let application = sqlx::query_as::<_, ApplicationDBResponse>(&format!(
            r#"
            UPDATE permit_applications SET folio = COALESCE(folio, $2), updated_at = NOW()
            WHERE id = $1
            RETURNING {APPLICATION_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(folio)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)?;

        Ok(application)
    }

    /// Take over a GENERATING_PERMIT claim started before `stale_before`.
    ///
    /// Restamps `permit_generation_started_at`, which invalidates the previous claim.
    #[instrument(skip(self), fields(application_id = %abbrev_uuid(&id)), err)]
    pub async fn reclaim_generation(&mut self, id: ApplicationId, stale_before: DateTime<Utc>) -> Result<Option<ApplicationDBResponse>> {
        let application = sqlx::query_as::<_, ApplicationDBResponse>(&format!(
            r#"
            UPDATE permit_applications SET permit_generation_started_at = NOW(), updated_at = NOW()
            WHERE id = $1
              AND status = 'GENERATING_PERMIT'
              AND (permit_generation_started_at IS NULL OR permit_generation_started_at < $2)
            RETURNING {APPLICATION_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(stale_before)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(application)
    }

    /// Next value of the permit folio sequence.
    #[instrument(skip(self), err)]
    pub async fn next_folio_number(&mut self) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as("SELECT nextval('permit_folio_seq')").fetch_one(&mut *self.db).await?;
        Ok(n)
    }

    #[instrument(skip(self), err)]
    pub async fn status_counts(&mut self) -> Result<Vec<StatusCount>> {
        let counts = sqlx::query_as::<_, StatusCount>(
            "SELECT status, COUNT(*) AS count FROM permit_applications GROUP BY status ORDER BY status",
        )
        .fetch_all(&mut *self.db)
        .await?;

        Ok(counts)
    }

    /// Issued permits past their validity and OXXO vouchers past their payment deadline.
    #[instrument(skip(self), err)]
    pub async fn due_for_expiry(&mut self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ApplicationDBResponse>> {
        let applications = sqlx::query_as::<_, ApplicationDBResponse>(&format!(
            r#"
            SELECT {APPLICATION_COLUMNS} FROM permit_applications
            WHERE (status = 'PERMIT_READY' AND valid_until < $1)
               OR (status = 'AWAITING_OXXO_PAYMENT' AND oxxo_expires_at < $1)
            ORDER BY updated_at
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *self.db)
        .await?;

        Ok(applications)
    }

    /// Paid applications whose issuance never finished: PAYMENT_RECEIVED left untouched since
    /// `stale_before`, or GENERATING_PERMIT claimed before it.
    #[instrument(skip(self), err)]
    pub async fn due_for_issuance(&mut self, stale_before: DateTime<Utc>, limit: i64) -> Result<Vec<ApplicationDBResponse>> {
        let applications = sqlx::query_as::<_, ApplicationDBResponse>(&format!(
            r#"
            SELECT {APPLICATION_COLUMNS} FROM permit_applications
            WHERE (status = 'PAYMENT_RECEIVED' AND updated_at < $1)
               OR (status = 'GENERATING_PERMIT' AND (permit_generation_started_at IS NULL OR permit_generation_started_at < $1))
            ORDER BY updated_at
            LIMIT $2
            "#
        ))
        .bind(stale_before)
        .bind(limit)
        .fetch_all(&mut *self.db)
        .await?;

        Ok(applications)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::applications::PaymentMethod;
    use crate::db::models::users::Role;
    use crate::test_utils::{create_test_application, create_test_user, test_application_request};
    use sqlx::PgPool;

    #[sqlx::test]
    async fn test_create_sets_initial_status_per_method(pool: PgPool) {
        let user = create_test_user(&pool, Role::Client).await;
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Applications::new(&mut conn);

        let card = repo.create(&test_application_request(user.id, PaymentMethod::Card)).await.unwrap();
        assert_eq!(card.status, ApplicationStatus::AwaitingPayment);
        assert_eq!(card.vin, "3N1AB7AP5KY250312");

        let oxxo = repo.create(&test_application_request(user.id, PaymentMethod::Oxxo)).await.unwrap();
        assert_eq!(oxxo.status, ApplicationStatus::AwaitingOxxoPayment);

        let mut renewal = test_application_request(user.id, PaymentMethod::Card);
        renewal.renewed_from_id = Some(card.id);
        let renewal = repo.create(&renewal).await.unwrap();
        assert_eq!(renewal.status, ApplicationStatus::RenewalPending);
    }

    #[sqlx::test]
    async fn test_apply_status_stamps_milestone_and_guards_source(pool: PgPool) {
        let user = create_test_user(&pool, Role::Client).await;
        let application = create_test_application(&pool, user.id).await;
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Applications::new(&mut conn);

        let updated = repo
            .apply_status(application.id, ApplicationStatus::AwaitingPayment, ApplicationStatus::PaymentReceived)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, ApplicationStatus::PaymentReceived);
        assert!(updated.payment_verified_at.is_some());

        // Stale source status matches nothing
        let stale = repo
            .apply_status(application.id, ApplicationStatus::AwaitingPayment, ApplicationStatus::PaymentFailed)
            .await
            .unwrap();
        assert!(stale.is_none());
    }

    #[sqlx::test]
    async fn test_update_only_while_editable(pool: PgPool) {
        let user = create_test_user(&pool, Role::Client).await;
        let application = create_test_application(&pool, user.id).await;
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Applications::new(&mut conn);

        let updated = repo
            .update(
                application.id,
                &ApplicationUpdateDBRequest {
                    color: Some("Rojo".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.color, "Rojo");
        assert_eq!(updated.status, ApplicationStatus::AwaitingPayment);

        repo.apply_status(application.id, ApplicationStatus::AwaitingPayment, ApplicationStatus::PaymentReceived)
            .await
            .unwrap();

        let err = repo
            .update(
                application.id,
                &ApplicationUpdateDBRequest {
                    color: Some("Azul".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::ProtectedEntity { .. }));
    }

    #[sqlx::test]
    async fn test_list_and_count_with_filters(pool: PgPool) {
        let alice = create_test_user(&pool, Role::Client).await;
        let bob = create_test_user(&pool, Role::Client).await;
        create_test_application(&pool, alice.id).await;
        create_test_application(&pool, alice.id).await;
        let bobs = create_test_application(&pool, bob.id).await;

        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Applications::new(&mut conn);
        repo.apply_status(bobs.id, ApplicationStatus::AwaitingPayment, ApplicationStatus::Cancelled)
            .await
            .unwrap();

        let mine = ApplicationFilter {
            user_id: Some(alice.id),
            limit: 10,
            ..Default::default()
        };
        assert_eq!(repo.list(&mine).await.unwrap().len(), 2);
        assert_eq!(repo.count(&mine).await.unwrap(), 2);

        let cancelled = ApplicationFilter {
            status: Some(ApplicationStatus::Cancelled),
            limit: 10,
            ..Default::default()
        };
        let found = repo.list(&cancelled).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, bobs.id);

        let counts = repo.status_counts().await.unwrap();
        let awaiting = counts.iter().find(|c| c.status == ApplicationStatus::AwaitingPayment).unwrap();
        assert_eq!(awaiting.count, 2);
    }

    #[sqlx::test]
    async fn test_payment_reference_lookup(pool: PgPool) {
        let user = create_test_user(&pool, Role::Client).await;
        let application = create_test_application(&pool, user.id).await;
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Applications::new(&mut conn);

        repo.set_payment_reference(
            application.id,
            &PaymentReferenceUpdate {
                payment_method: PaymentMethod::Card,
                payment_reference: "pi_123".to_string(),
                oxxo_reference: None,
                oxxo_expires_at: None,
            },
        )
        .await
        .unwrap();

        let found = repo.find_by_payment_reference("pi_123").await.unwrap().unwrap();
        assert_eq!(found.id, application.id);
        assert!(repo.find_by_payment_reference("pi_other").await.unwrap().is_none());
    }

    #[sqlx::test]
    async fn test_due_for_expiry(pool: PgPool) {
        let user = create_test_user(&pool, Role::Client).await;
        let application = create_test_application(&pool, user.id).await;
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Applications::new(&mut conn);

        repo.set_payment_reference(
            application.id,
            &PaymentReferenceUpdate {
                payment_method: PaymentMethod::Oxxo,
                payment_reference: "pi_oxxo".to_string(),
                oxxo_reference: Some("9300 1234".to_string()),
                oxxo_expires_at: Some(Utc::now() - chrono::Duration::hours(1)),
            },
        )
        .await
        .unwrap();
        repo.apply_status(application.id, ApplicationStatus::AwaitingPayment, ApplicationStatus::AwaitingOxxoPayment)
            .await
            .unwrap();

        let due = repo.due_for_expiry(Utc::now(), 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, application.id);
    }

    #[sqlx::test]
    async fn test_permit_document_needs_the_live_claim(pool: PgPool) {
        let user = create_test_user(&pool, Role::Client).await;
        let application = create_test_application(&pool, user.id).await;
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Applications::new(&mut conn);

        repo.apply_status(application.id, ApplicationStatus::AwaitingPayment, ApplicationStatus::PaymentReceived)
            .await
            .unwrap();
        let generating = repo
            .apply_status(application.id, ApplicationStatus::PaymentReceived, ApplicationStatus::GeneratingPermit)
            .await
            .unwrap()
            .unwrap();
        let claimed_at = generating.permit_generation_started_at.unwrap();

        let reserved = repo.reserve_folio(application.id, "PD-2025-000001").await.unwrap();
        assert_eq!(reserved.folio.as_deref(), Some("PD-2025-000001"));
        let kept = repo.reserve_folio(application.id, "PD-2025-000002").await.unwrap();
        assert_eq!(kept.folio.as_deref(), Some("PD-2025-000001"));

        // A fresh claim is not stale yet
        assert!(repo.reclaim_generation(application.id, claimed_at).await.unwrap().is_none());
        let taken_over = repo
            .reclaim_generation(application.id, Utc::now() + chrono::Duration::minutes(1))
            .await
            .unwrap()
            .unwrap();
        let new_claim = taken_over.permit_generation_started_at.unwrap();

        let update = PermitDocumentUpdate {
            folio: "PD-2025-000001".to_string(),
            permit_file_path: "2025/03/PD-2025-000001.pdf".to_string(),
            valid_from: Utc::now(),
            valid_until: Utc::now() + chrono::Duration::days(30),
        };
        if new_claim != claimed_at {
            assert!(repo.set_permit_document(application.id, claimed_at, &update).await.unwrap().is_none());
        }
        let saved = repo.set_permit_document(application.id, new_claim, &update).await.unwrap().unwrap();
        assert_eq!(saved.permit_file_path.as_deref(), Some("2025/03/PD-2025-000001.pdf"));
    }

    #[sqlx::test]
    async fn test_due_for_issuance(pool: PgPool) {
        let user = create_test_user(&pool, Role::Client).await;
        let paid = create_test_application(&pool, user.id).await;
        let waiting = create_test_application(&pool, user.id).await;
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Applications::new(&mut conn);

        repo.apply_status(paid.id, ApplicationStatus::AwaitingPayment, ApplicationStatus::PaymentReceived)
            .await
            .unwrap();

        assert!(repo.due_for_issuance(Utc::now() - chrono::Duration::minutes(10), 10).await.unwrap().is_empty());

        let due = repo.due_for_issuance(Utc::now() + chrono::Duration::minutes(1), 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, paid.id);
        assert!(due.iter().all(|a| a.id != waiting.id));
    }
}
