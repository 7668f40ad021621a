use anyhow::Result;
use holdall::tree::{self, NewItem, NewLocation};
use holdall::{AppError, Ctx, Location, PreviewStore};
use sqlx::SqlitePool;

#[path = "util.rs"]
mod util;

async fn garage_fixture(pool: &SqlitePool, ctx: &Ctx) -> Result<(Location, Location)> {
    let garage = tree::location_create(
        pool,
        ctx,
        NewLocation {
            name: "Garage".into(),
            ..Default::default()
        },
    )
    .await?;
    let shelf = tree::location_create(
        pool,
        ctx,
        NewLocation {
            name: "Shelf A".into(),
            parent_id: Some(garage.id.clone()),
            ..Default::default()
        },
    )
    .await?;
    tree::item_create(
        pool,
        ctx,
        NewItem {
            name: "Drill".into(),
            location_id: shelf.id.clone(),
            ..Default::default()
        },
    )
    .await?;
    Ok((garage, shelf))
}

#[tokio::test]
async fn moving_under_a_descendant_is_rejected() -> Result<()> {
    let (pool, _, ctx) = util::household_fixture("owner-1").await?;
    let (garage, shelf) = garage_fixture(&pool, &ctx).await?;
    let store = PreviewStore::new();

    let err = holdall::moves::move_preview(&pool, &ctx, &store, &garage.id, Some(&shelf.id))
        .await
        .expect_err("cycle rejected");
    assert_eq!(err.code(), AppError::INVALID_OPERATION);
    assert!(err.message().contains("cycle"));
    Ok(())
}

#[tokio::test]
async fn moving_under_itself_is_rejected() -> Result<()> {
    let (pool, _, ctx) = util::household_fixture("owner-1").await?;
    let (garage, _) = garage_fixture(&pool, &ctx).await?;
    let store = PreviewStore::new();

    let err = holdall::moves::move_preview(&pool, &ctx, &store, &garage.id, Some(&garage.id))
        .await
        .expect_err("self parent rejected");
    assert_eq!(err.code(), AppError::INVALID_OPERATION);
    Ok(())
}

#[tokio::test]
async fn noop_move_is_rejected_before_preview() -> Result<()> {
    let (pool, _, ctx) = util::household_fixture("owner-1").await?;
    let (garage, shelf) = garage_fixture(&pool, &ctx).await?;
    let store = PreviewStore::new();

    let err = holdall::moves::move_preview(&pool, &ctx, &store, &shelf.id, Some(&garage.id))
        .await
        .expect_err("same parent rejected");
    assert_eq!(err.code(), AppError::INVALID_OPERATION);
    Ok(())
}

#[tokio::test]
async fn preview_reports_impact_without_mutating() -> Result<()> {
    let (pool, _, ctx) = util::household_fixture("owner-1").await?;
    let (_, shelf) = garage_fixture(&pool, &ctx).await?;
    let store = PreviewStore::new();

    let preview =
        holdall::moves::move_preview(&pool, &ctx, &store, &shelf.id, None).await?;
    assert_eq!(preview.affected_locations, 1);
    assert_eq!(preview.affected_items, 1);
    assert_eq!(preview.sample.len(), 1);
    assert_eq!(preview.sample[0].item_name, "Drill");
    assert_eq!(preview.sample[0].before_path, "Garage > Shelf A > Drill");
    assert_eq!(preview.sample[0].after_path, "Shelf A > Drill");

    // Nothing moved yet.
    let shelf_now = tree::location_get(&pool, &ctx, &shelf.id).await?;
    assert_eq!(shelf_now.path, "Garage > Shelf A");
    assert!(shelf_now.parent_id.is_some());
    Ok(())
}

#[tokio::test]
async fn commit_matches_preview_when_state_is_unchanged() -> Result<()> {
    let (pool, _, ctx) = util::household_fixture("owner-1").await?;
    let (_, shelf) = garage_fixture(&pool, &ctx).await?;
    let store = PreviewStore::new();

    let preview =
        holdall::moves::move_preview(&pool, &ctx, &store, &shelf.id, None).await?;
    let receipt = holdall::moves::move_commit(&pool, &ctx, &store, &preview.token).await?;

    assert_eq!(receipt.affected_locations, preview.affected_locations);
    assert_eq!(receipt.affected_items, preview.affected_items);

    let shelf_now = tree::location_get(&pool, &ctx, &shelf.id).await?;
    assert!(shelf_now.parent_id.is_none());
    assert_eq!(shelf_now.path, "Shelf A");

    let items = tree::item_list(&pool, &ctx, Some(&shelf.id)).await?;
    let drill = &items[0];
    let path = tree::location_path(&pool, &ctx, &drill.location_id).await?;
    assert_eq!(format!("{} > {}", path.join(" > "), drill.name), "Shelf A > Drill");
    Ok(())
}

#[tokio::test]
async fn commit_rewrites_paths_for_the_whole_subtree() -> Result<()> {
    let (pool, _, ctx) = util::household_fixture("owner-1").await?;
    let (garage, shelf) = garage_fixture(&pool, &ctx).await?;
    let bin = tree::location_create(
        &pool,
        &ctx,
        NewLocation {
            name: "Bin".into(),
            parent_id: Some(shelf.id.clone()),
            ..Default::default()
        },
    )
    .await?;
    let attic = tree::location_create(
        &pool,
        &ctx,
        NewLocation {
            name: "Attic".into(),
            ..Default::default()
        },
    )
    .await?;
    let store = PreviewStore::new();

    let preview =
        holdall::moves::move_preview(&pool, &ctx, &store, &shelf.id, Some(&attic.id)).await?;
    assert_eq!(preview.affected_locations, 2);
    let receipt = holdall::moves::move_commit(&pool, &ctx, &store, &preview.token).await?;
    assert_eq!(receipt.affected_locations, 2);

    let bin_now = tree::location_get(&pool, &ctx, &bin.id).await?;
    assert_eq!(bin_now.path, "Attic > Shelf A > Bin");
    let garage_now = tree::location_get(&pool, &ctx, &garage.id).await?;
    assert_eq!(garage_now.path, "Garage");
    Ok(())
}

#[tokio::test]
async fn commit_conflicts_when_state_changed_since_preview() -> Result<()> {
    let (pool, _, ctx) = util::household_fixture("owner-1").await?;
    let (_, shelf) = garage_fixture(&pool, &ctx).await?;
    let attic = tree::location_create(
        &pool,
        &ctx,
        NewLocation {
            name: "Attic".into(),
            ..Default::default()
        },
    )
    .await?;
    let store = PreviewStore::new();

    let preview =
        holdall::moves::move_preview(&pool, &ctx, &store, &shelf.id, Some(&attic.id)).await?;
    tree::location_delete(&pool, &ctx, &attic.id).await?;

    let err = holdall::moves::move_commit(&pool, &ctx, &store, &preview.token)
        .await
        .expect_err("missing target conflicts");
    assert_eq!(err.code(), AppError::CONFLICT);
    Ok(())
}

#[tokio::test]
async fn tokens_are_single_use_and_expire() -> Result<()> {
    let (pool, _, ctx) = util::household_fixture("owner-1").await?;
    let (_, shelf) = garage_fixture(&pool, &ctx).await?;

    let store = PreviewStore::new();
    let preview =
        holdall::moves::move_preview(&pool, &ctx, &store, &shelf.id, None).await?;
    holdall::moves::move_commit(&pool, &ctx, &store, &preview.token).await?;
    let err = holdall::moves::move_commit(&pool, &ctx, &store, &preview.token)
        .await
        .expect_err("token already consumed");
    assert_eq!(err.code(), AppError::CONFLICT);

    let expired_store = PreviewStore::with_ttl(-1);
    let preview = holdall::moves::move_preview(&pool, &ctx, &expired_store, &shelf.id, Some(&shelf.parent_id.clone().unwrap()))
        .await;
    // The shelf now sits at the root, so moving it back under the old garage
    // parent is a real move; only the token is stale.
    let preview = preview?;
    let err = holdall::moves::move_commit(&pool, &ctx, &expired_store, &preview.token)
        .await
        .expect_err("expired token rejected");
    assert_eq!(err.code(), AppError::CONFLICT);
    Ok(())
}
