use futures::FutureExt;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::info;

use crate::db::run_in_tx;
use crate::id::new_uuid_v7;
use crate::model::{Household, Invitation, Member, Role};
use crate::security::{Ctx, Operation};
use crate::time::now_ms;
use crate::{AppError, AppResult};

/// Default invitation lifetime: 7 days.
pub const INVITATION_TTL_MS: i64 = 7 * 24 * 60 * 60 * 1000;

#[derive(Error, Debug)]
pub enum MembershipError {
    #[error("household must retain at least one owner")]
    LastOwner,
    #[error("member not found")]
    NotFound,
    #[error("user is already a member of this household")]
    AlreadyMember,
    #[error("invitation has expired")]
    InvitationExpired,
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

impl From<MembershipError> for AppError {
    fn from(err: MembershipError) -> Self {
        match err {
            MembershipError::LastOwner => {
                AppError::conflict("Household must retain at least one owner")
            }
            MembershipError::NotFound => AppError::not_found("Member not found"),
            MembershipError::AlreadyMember => {
                AppError::conflict("User is already a member of this household")
            }
            MembershipError::InvitationExpired => AppError::invalid("Invitation has expired"),
            MembershipError::Db(e) => AppError::from(e),
        }
    }
}

/// Create a household with the calling user as its first owner.
pub async fn create_household(
    pool: &SqlitePool,
    name: &str,
    owner_user_id: &str,
) -> AppResult<Household> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::invalid("Household name must not be empty"));
    }

    let id = new_uuid_v7();
    let now = now_ms();
    let household = Household {
        id: id.clone(),
        name: name.to_string(),
        created_at: now,
        updated_at: now,
        deleted_at: None,
    };

    let owner = owner_user_id.to_string();
    let hh = household.clone();
    run_in_tx::<_, AppError, _>(pool, move |tx| {
        async move {
            sqlx::query(
                "INSERT INTO household (id, name, created_at, updated_at) VALUES (?, ?, ?, ?)",
            )
            .bind(&hh.id)
            .bind(&hh.name)
            .bind(hh.created_at)
            .bind(hh.updated_at)
            .execute(&mut **tx)
            .await
            .map_err(AppError::from)?;

            sqlx::query(
                "INSERT INTO member (household_id, user_id, role, created_at, updated_at) \
                 VALUES (?, ?, 'owner', ?, ?)",
            )
            .bind(&hh.id)
            .bind(&owner)
            .bind(hh.created_at)
            .bind(hh.updated_at)
            .execute(&mut **tx)
            .await
            .map_err(AppError::from)?;

            Ok(())
        }
        .boxed()
    })
    .await?;

    info!(target = "holdall", event = "household_created", id = %id);
    Ok(household)
}

pub async fn get_household(pool: &SqlitePool, ctx: &Ctx) -> AppResult<Household> {
    ctx.require(Operation::Read)?;
    let row = sqlx::query("SELECT * FROM household WHERE id = ? AND deleted_at IS NULL")
        .bind(&ctx.household_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::from)?;
    match row {
        Some(row) => Household::from_row(&row),
        None => Err(AppError::not_found("Household not found")),
    }
}

pub async fn rename_household(pool: &SqlitePool, ctx: &Ctx, name: &str) -> AppResult<()> {
    ctx.require(Operation::ManageMembers)?;
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::invalid("Household name must not be empty"));
    }
    let res = sqlx::query(
        "UPDATE household SET name = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
    )
    .bind(name)
    .bind(now_ms())
    .bind(&ctx.household_id)
    .execute(pool)
    .await
    .map_err(AppError::from)?;
    if res.rows_affected() == 0 {
        return Err(AppError::not_found("Household not found"));
    }
    Ok(())
}

/// Soft-delete a household. Inventory rows stay behind the tombstone.
pub async fn delete_household(pool: &SqlitePool, ctx: &Ctx) -> AppResult<()> {
    ctx.require(Operation::ManageMembers)?;
    let res = sqlx::query(
        "UPDATE household SET deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
    )
    .bind(now_ms())
    .bind(now_ms())
    .bind(&ctx.household_id)
    .execute(pool)
    .await
    .map_err(AppError::from)?;
    if res.rows_affected() == 0 {
        return Err(AppError::not_found("Household not found"));
    }
    info!(target = "holdall", event = "household_deleted", id = %ctx.household_id);
    Ok(())
}

pub async fn list_members(pool: &SqlitePool, ctx: &Ctx) -> AppResult<Vec<Member>> {
    ctx.require(Operation::Read)?;
    let rows = sqlx::query(
        "SELECT * FROM member WHERE household_id = ? ORDER BY created_at, user_id",
    )
    .bind(&ctx.household_id)
    .fetch_all(pool)
    .await
    .map_err(AppError::from)?;
    rows.iter().map(Member::from_row).collect()
}

async fn owner_count(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    household_id: &str,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM member WHERE household_id = ? AND role = 'owner'")
        .bind(household_id)
        .fetch_one(&mut **tx)
        .await
}

/// Change a member's role. Demoting the sole remaining owner is a conflict.
pub async fn member_set_role(
    pool: &SqlitePool,
    ctx: &Ctx,
    user_id: &str,
    role: Role,
) -> AppResult<()> {
    ctx.require(Operation::ManageMembers)?;

    let household_id = ctx.household_id.clone();
    let user = user_id.to_string();
    run_in_tx::<_, MembershipError, _>(pool, move |tx| {
        async move {
            let current: Option<String> = sqlx::query_scalar(
                "SELECT role FROM member WHERE household_id = ? AND user_id = ?",
            )
            .bind(&household_id)
            .bind(&user)
            .fetch_optional(&mut **tx)
            .await?;

            let current = current.ok_or(MembershipError::NotFound)?;
            if current == "owner"
                && role != Role::Owner
                && owner_count(tx, &household_id).await? <= 1
            {
                return Err(MembershipError::LastOwner);
            }

            sqlx::query(
                "UPDATE member SET role = ?, updated_at = ? WHERE household_id = ? AND user_id = ?",
            )
            .bind(role.as_str())
            .bind(now_ms())
            .bind(&household_id)
            .bind(&user)
            .execute(&mut **tx)
            .await?;
            Ok(())
        }
        .boxed()
    })
    .await
    .map_err(AppError::from)
}

/// Remove a member. Removing the sole remaining owner is a conflict.
pub async fn member_remove(pool: &SqlitePool, ctx: &Ctx, user_id: &str) -> AppResult<()> {
    ctx.require(Operation::ManageMembers)?;

    let household_id = ctx.household_id.clone();
    let user = user_id.to_string();
    run_in_tx::<_, MembershipError, _>(pool, move |tx| {
        async move {
            let current: Option<String> = sqlx::query_scalar(
                "SELECT role FROM member WHERE household_id = ? AND user_id = ?",
            )
            .bind(&household_id)
            .bind(&user)
            .fetch_optional(&mut **tx)
            .await?;

            let current = current.ok_or(MembershipError::NotFound)?;
            if current == "owner" && owner_count(tx, &household_id).await? <= 1 {
                return Err(MembershipError::LastOwner);
            }

            sqlx::query("DELETE FROM member WHERE household_id = ? AND user_id = ?")
                .bind(&household_id)
                .bind(&user)
                .execute(&mut **tx)
                .await?;
            Ok(())
        }
        .boxed()
    })
    .await
    .map_err(AppError::from)
}

pub async fn invitation_create(
    pool: &SqlitePool,
    ctx: &Ctx,
    email: &str,
    role: Role,
) -> AppResult<Invitation> {
    ctx.require(Operation::ManageMembers)?;
    let email = email.trim();
    if email.is_empty() {
        return Err(AppError::invalid("Invitation email must not be empty"));
    }

    let now = now_ms();
    let invitation = Invitation {
        id: new_uuid_v7(),
        household_id: ctx.household_id.clone(),
        email: email.to_string(),
        role,
        expires_at: now + INVITATION_TTL_MS,
        created_at: now,
    };

    sqlx::query(
        "INSERT INTO invitation (id, household_id, email, role, expires_at, created_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&invitation.id)
    .bind(&invitation.household_id)
    .bind(&invitation.email)
    .bind(invitation.role.as_str())
    .bind(invitation.expires_at)
    .bind(invitation.created_at)
    .execute(pool)
    .await
    .map_err(AppError::from)?;

    info!(target = "holdall", event = "invitation_created", id = %invitation.id);
    Ok(invitation)
}

pub async fn list_invitations(pool: &SqlitePool, ctx: &Ctx) -> AppResult<Vec<Invitation>> {
    ctx.require(Operation::ManageMembers)?;
    let rows = sqlx::query("SELECT * FROM invitation WHERE household_id = ? ORDER BY created_at")
        .bind(&ctx.household_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::from)?;
    rows.iter().map(Invitation::from_row).collect()
}

pub async fn invitation_revoke(pool: &SqlitePool, ctx: &Ctx, invitation_id: &str) -> AppResult<()> {
    ctx.require(Operation::ManageMembers)?;
    let res = sqlx::query("DELETE FROM invitation WHERE id = ? AND household_id = ?")
        .bind(invitation_id)
        .bind(&ctx.household_id)
        .execute(pool)
        .await
        .map_err(AppError::from)?;
    if res.rows_affected() == 0 {
        return Err(AppError::not_found("Invitation not found"));
    }
    Ok(())
}

/// Accept an invitation on behalf of the invitee. The invitee has no role in
/// the household yet, so this takes a bare user id instead of a `Ctx`.
/// Consumes the invitation whatever the outcome of the expiry check.
pub async fn invitation_accept(
    pool: &SqlitePool,
    invitation_id: &str,
    user_id: &str,
) -> AppResult<Member> {
    let invitation_id = invitation_id.to_string();
    let user = user_id.to_string();
    // An expired invitation is consumed too: the delete must commit while the
    // acceptance still fails, so the closure reports expiry as a value.
    let accepted = run_in_tx::<_, AppError, _>(pool, move |tx| {
        async move {
            let row = sqlx::query("SELECT * FROM invitation WHERE id = ?")
                .bind(&invitation_id)
                .fetch_optional(&mut **tx)
                .await
                .map_err(AppError::from)?;
            let invitation = match row {
                Some(row) => Invitation::from_row(&row)?,
                None => return Err(AppError::not_found("Invitation not found")),
            };

            sqlx::query("DELETE FROM invitation WHERE id = ?")
                .bind(&invitation_id)
                .execute(&mut **tx)
                .await
                .map_err(AppError::from)?;

            if invitation.expires_at <= now_ms() {
                return Ok(None);
            }

            let existing: Option<String> = sqlx::query_scalar(
                "SELECT role FROM member WHERE household_id = ? AND user_id = ?",
            )
            .bind(&invitation.household_id)
            .bind(&user)
            .fetch_optional(&mut **tx)
            .await
            .map_err(AppError::from)?;
            if existing.is_some() {
                return Err(MembershipError::AlreadyMember.into());
            }

            let now = now_ms();
            sqlx::query(
                "INSERT INTO member (household_id, user_id, role, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&invitation.household_id)
            .bind(&user)
            .bind(invitation.role.as_str())
            .bind(now)
            .bind(now)
            .execute(&mut **tx)
            .await
            .map_err(AppError::from)?;

            Ok(Some(Member {
                household_id: invitation.household_id,
                user_id: user,
                role: invitation.role,
                created_at: now,
                updated_at: now,
            }))
        }
        .boxed()
    })
    .await?;

    accepted.ok_or_else(|| MembershipError::InvitationExpired.into())
}
