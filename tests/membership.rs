use anyhow::Result;
use holdall::model::Role;
use holdall::{household, AppError, Ctx};

#[path = "util.rs"]
mod util;

#[tokio::test]
async fn sole_owner_cannot_be_demoted_or_removed() -> Result<()> {
    let (pool, _, ctx) = util::household_fixture("owner-1").await?;

    let err = household::member_set_role(&pool, &ctx, "owner-1", Role::Editor)
        .await
        .expect_err("sole owner demotion blocked");
    assert_eq!(err.code(), AppError::CONFLICT);

    let err = household::member_remove(&pool, &ctx, "owner-1")
        .await
        .expect_err("sole owner removal blocked");
    assert_eq!(err.code(), AppError::CONFLICT);
    Ok(())
}

#[tokio::test]
async fn owner_changes_are_allowed_once_another_owner_exists() -> Result<()> {
    let (pool, hh, ctx) = util::household_fixture("owner-1").await?;
    util::add_member(&pool, &hh, "owner-2", Role::Owner).await?;

    household::member_set_role(&pool, &ctx, "owner-1", Role::Editor).await?;
    let members = household::list_members(&pool, &ctx).await?;
    let me = members.iter().find(|m| m.user_id == "owner-1").unwrap();
    assert_eq!(me.role, Role::Editor);

    // owner-2 is now the sole owner and locked in place.
    let ctx2 = Ctx::resolve(&pool, "owner-2", &hh).await?;
    let err = household::member_remove(&pool, &ctx2, "owner-2")
        .await
        .expect_err("new sole owner locked");
    assert_eq!(err.code(), AppError::CONFLICT);

    household::member_remove(&pool, &ctx2, "owner-1").await?;
    let members = household::list_members(&pool, &ctx2).await?;
    assert_eq!(members.len(), 1);
    Ok(())
}

#[tokio::test]
async fn set_role_on_unknown_member_is_not_found() -> Result<()> {
    let (pool, _, ctx) = util::household_fixture("owner-1").await?;
    let err = household::member_set_role(&pool, &ctx, "ghost", Role::Viewer)
        .await
        .expect_err("unknown member");
    assert_eq!(err.code(), AppError::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn invitation_accept_grants_the_invited_role() -> Result<()> {
    let (pool, hh, ctx) = util::household_fixture("owner-1").await?;

    let invitation =
        household::invitation_create(&pool, &ctx, "friend@example.com", Role::Editor).await?;
    let member = household::invitation_accept(&pool, &invitation.id, "friend-1").await?;
    assert_eq!(member.role, Role::Editor);
    assert_eq!(member.household_id, hh);

    // Consumed on acceptance.
    let err = household::invitation_accept(&pool, &invitation.id, "friend-2")
        .await
        .expect_err("invitation consumed");
    assert_eq!(err.code(), AppError::NOT_FOUND);

    let friend_ctx = Ctx::resolve(&pool, "friend-1", &hh).await?;
    assert_eq!(friend_ctx.role, Role::Editor);
    Ok(())
}

#[tokio::test]
async fn expired_invitations_fail_and_are_consumed() -> Result<()> {
    let (pool, hh, _) = util::household_fixture("owner-1").await?;

    sqlx::query(
        "INSERT INTO invitation (id, household_id, email, role, expires_at, created_at) \
         VALUES ('inv-old', ?, 'late@example.com', 'viewer', 1, 1)",
    )
    .bind(&hh)
    .execute(&pool)
    .await?;

    let err = household::invitation_accept(&pool, "inv-old", "late-1")
        .await
        .expect_err("expired invitation");
    assert_eq!(err.code(), AppError::INVALID_OPERATION);

    // The expired row is gone even though acceptance failed.
    let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM invitation WHERE id = 'inv-old'")
        .fetch_one(&pool)
        .await?;
    assert_eq!(remaining, 0);
    Ok(())
}

#[tokio::test]
async fn revocation_deletes_the_invitation() -> Result<()> {
    let (pool, _, ctx) = util::household_fixture("owner-1").await?;

    let invitation =
        household::invitation_create(&pool, &ctx, "friend@example.com", Role::Viewer).await?;
    let listed = household::list_invitations(&pool, &ctx).await?;
    assert_eq!(listed.len(), 1);

    household::invitation_revoke(&pool, &ctx, &invitation.id).await?;
    let err = household::invitation_accept(&pool, &invitation.id, "friend-1")
        .await
        .expect_err("revoked invitation");
    assert_eq!(err.code(), AppError::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn accepting_twice_for_an_existing_member_conflicts() -> Result<()> {
    let (pool, hh, ctx) = util::household_fixture("owner-1").await?;
    util::add_member(&pool, &hh, "friend-1", Role::Viewer).await?;

    let invitation =
        household::invitation_create(&pool, &ctx, "friend@example.com", Role::Editor).await?;
    let err = household::invitation_accept(&pool, &invitation.id, "friend-1")
        .await
        .expect_err("already a member");
    assert_eq!(err.code(), AppError::CONFLICT);
    Ok(())
}

#[tokio::test]
async fn household_rename_requires_owner() -> Result<()> {
    let (pool, hh, ctx) = util::household_fixture("owner-1").await?;
    util::add_member(&pool, &hh, "editor-1", Role::Editor).await?;
    let editor_ctx = Ctx::resolve(&pool, "editor-1", &hh).await?;

    let err = household::rename_household(&pool, &editor_ctx, "New Name")
        .await
        .expect_err("editor cannot rename");
    assert_eq!(err.code(), AppError::FORBIDDEN);

    household::rename_household(&pool, &ctx, "Willow Lane 2").await?;
    let fetched = household::get_household(&pool, &ctx).await?;
    assert_eq!(fetched.name, "Willow Lane 2");
    Ok(())
}
