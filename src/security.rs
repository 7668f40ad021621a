use futures::future::BoxFuture;
use sqlx::SqlitePool;
use tracing::warn;

use crate::model::Role;
use crate::{AppError, AppResult};

/// Resolves a bearer credential to a user id. Implemented outside the core;
/// tests use a fixture. `None` means the credential is invalid.
pub trait IdentityResolver: Send + Sync {
    fn resolve<'a>(&'a self, credential: &'a str) -> BoxFuture<'a, AppResult<Option<String>>>;
}

/// The operations the permission matrix distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Tree fetch, path lookup, item reads, search.
    Read,
    /// Location/item create, update, rename, delete, move preview and commit.
    Write,
    /// Membership and invitation management.
    ManageMembers,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::ManageMembers => "manage_members",
        }
    }
}

/// Single lookup point for operation × role, instead of branching in handlers.
const fn allowed(op: Operation, role: Role) -> bool {
    match op {
        Operation::Read => true,
        Operation::Write => matches!(role, Role::Owner | Role::Editor),
        Operation::ManageMembers => matches!(role, Role::Owner),
    }
}

/// A resolved caller: identity plus household role. Every core entry point
/// takes one of these; nothing below this layer re-checks identity.
#[derive(Debug, Clone)]
pub struct Ctx {
    pub household_id: String,
    pub user_id: String,
    pub role: Role,
}

impl Ctx {
    /// Look up the caller's membership in the household.
    ///
    /// A missing membership and a nonexistent household produce the same
    /// `NOT_FOUND`, so callers can never probe for other households.
    pub async fn resolve(
        pool: &SqlitePool,
        user_id: &str,
        household_id: &str,
    ) -> AppResult<Ctx> {
        match role_for(pool, user_id, household_id).await? {
            Some(role) => Ok(Ctx {
                household_id: household_id.to_string(),
                user_id: user_id.to_string(),
                role,
            }),
            None => Err(AppError::not_found("Household not found")),
        }
    }

    pub fn require(&self, op: Operation) -> AppResult<()> {
        if allowed(op, self.role) {
            Ok(())
        } else {
            warn!(
                target = "holdall",
                event = "permission_denied",
                user_id = %self.user_id,
                household_id = %self.household_id,
                operation = %op.as_str(),
                role = %self.role.as_str()
            );
            Err(AppError::forbidden("Role does not permit this operation")
                .with_context("operation", op.as_str())
                .with_context("role", self.role.as_str()))
        }
    }
}

/// Resolve a bearer credential to a caller context in one step.
///
/// An invalid credential is `FORBIDDEN`; a valid credential without a
/// membership falls through to the `NOT_FOUND` of [`Ctx::resolve`].
pub async fn authenticate(
    pool: &SqlitePool,
    resolver: &dyn IdentityResolver,
    credential: &str,
    household_id: &str,
) -> AppResult<Ctx> {
    let user_id = resolver
        .resolve(credential)
        .await?
        .ok_or_else(|| AppError::forbidden("Credential is not valid"))?;
    Ctx::resolve(pool, &user_id, household_id).await
}

/// Read the caller's role, ignoring soft-deleted households.
pub async fn role_for(
    pool: &SqlitePool,
    user_id: &str,
    household_id: &str,
) -> AppResult<Option<Role>> {
    let role: Option<String> = sqlx::query_scalar(
        "SELECT m.role FROM member m \
         JOIN household h ON h.id = m.household_id \
         WHERE m.household_id = ? AND m.user_id = ? AND h.deleted_at IS NULL",
    )
    .bind(household_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .map_err(AppError::from)?;

    role.map(|r| Role::parse(&r)).transpose()
}
