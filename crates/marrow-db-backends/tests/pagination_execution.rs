//! Paginator behavior against live SQLite data: numbered pages with sibling
//! links, negative page numbers, keyset (cursor) pages, composite cursors,
//! and backward traversal.

use std::sync::{Arc, LazyLock};

use marrow_db::fields::{FieldDef, FieldType};
use marrow_db::model::{Model, ModelMeta};
use marrow_db::value::{Row, Value};
use marrow_db::{
    Cursor, CursorPaginator, DbExecutor, ModelLifecycleHooks, OrmError, OrmResult, Paginator,
    QuerySet,
};
use marrow_db_backends::{DatabaseBackend, SqliteBackend};

#[derive(Debug, Clone, Default)]
struct Track {
    id: i64,
    title: String,
    rank: i64,
}

fn track_meta() -> &'static ModelMeta {
    static META: LazyLock<ModelMeta> = LazyLock::new(|| ModelMeta {
        table: "tracks",
        fields: vec![
            FieldDef::new("id", FieldType::BigAuto).primary_key(),
            FieldDef::new("title", FieldType::Char),
            FieldDef::new("rank", FieldType::Integer),
        ],
    });
    &META
}

impl Model for Track {
    fn meta() -> &'static ModelMeta {
        track_meta()
    }
    fn pk(&self) -> Option<Value> {
        (self.id != 0).then(|| Value::Int(self.id))
    }
    fn set_pk(&mut self, value: Value) {
        if let Value::Int(id) = value {
            self.id = id;
        }
    }
    fn field_values(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", Value::Int(self.id)),
            ("title", Value::String(self.title.clone())),
            ("rank", Value::Int(self.rank)),
        ]
    }
    fn from_row(row: &Row) -> OrmResult<Self> {
        Ok(Self {
            id: row.get::<Option<i64>>("id")?.unwrap_or_default(),
            title: row.get::<Option<String>>("title")?.unwrap_or_default(),
            rank: row.get::<Option<i64>>("rank")?.unwrap_or_default(),
        })
    }
}

#[async_trait::async_trait]
impl ModelLifecycleHooks for Track {}

/// Seeds 23 tracks with ids 1..=23; ranks repeat in groups of four
/// (ids 1-4 → rank 0, 5-8 → rank 1, ...) so composite cursors cross
/// duplicate groups.
async fn seeded_db() -> SqliteBackend {
    let db = SqliteBackend::memory().unwrap();
    db.execute_batch(
        "CREATE TABLE tracks (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             title TEXT NOT NULL,
             rank INTEGER NOT NULL
         );",
    )
    .await
    .unwrap();

    let qs = QuerySet::<Track>::new();
    let tracks: Vec<Track> = (1..=23)
        .map(|i| Track {
            id: 0,
            title: format!("track-{i:02}"),
            rank: (i - 1) / 4,
        })
        .collect();
    qs.bulk_create(&db, tracks).await.unwrap();
    db
}

fn ordered() -> QuerySet<Track> {
    QuerySet::<Track>::new().order_by(&["id"])
}

fn page_ids(items: &[marrow_db::PageItem<Track>]) -> Vec<i64> {
    items.iter().map(|i| i.item.id).collect()
}

// ----- numbered pagination --------------------------------------------------

#[tokio::test]
async fn test_totals_and_page_count() {
    let db = seeded_db().await;
    let paginator = Paginator::new(ordered(), 5).unwrap();
    assert_eq!(paginator.get_total(&db).await.unwrap(), 23);
    assert_eq!(paginator.get_amount_pages(&db).await.unwrap(), 5);
}

#[tokio::test]
async fn test_forward_pages_and_bounds() {
    let db = seeded_db().await;
    let paginator = Paginator::new(ordered(), 5).unwrap();

    let first = paginator.get_page(&db, 1).await.unwrap();
    assert_eq!(page_ids(&first.items), vec![1, 2, 3, 4, 5]);
    assert!(!first.has_previous);
    assert!(first.has_next);

    let last = paginator.get_page(&db, 5).await.unwrap();
    assert_eq!(page_ids(&last.items), vec![21, 22, 23]);
    assert!(last.has_previous);
    assert!(!last.has_next);

    assert!(matches!(
        paginator.get_page(&db, 0).await.unwrap_err(),
        OrmError::InvalidPage(_)
    ));
    assert!(matches!(
        paginator.get_page(&db, 6).await.unwrap_err(),
        OrmError::InvalidPage(_)
    ));
}

#[tokio::test]
async fn test_sibling_links_reach_across_pages() {
    let db = seeded_db().await;
    let paginator = Paginator::with_previous_links(ordered(), 5).unwrap();

    let page = paginator.get_page(&db, 2).await.unwrap();
    assert_eq!(page_ids(&page.items), vec![6, 7, 8, 9, 10]);

    // Edges link to the rows fetched as leading/trailing lookahead.
    assert_eq!(page.items[0].previous.as_ref().unwrap().id, 5);
    assert_eq!(page.items[4].next.as_ref().unwrap().id, 11);

    // Interior links stay within the page and share allocations.
    assert_eq!(page.items[1].previous.as_ref().unwrap().id, 6);
    assert!(Arc::ptr_eq(
        page.items[1].previous.as_ref().unwrap(),
        &page.items[0].item
    ));
}

#[tokio::test]
async fn test_negative_page_counts_from_the_end() {
    let db = seeded_db().await;
    let paginator = Paginator::new(ordered(), 5).unwrap();

    let page = paginator.get_page(&db, -1).await.unwrap();
    assert_eq!(page_ids(&page.items), vec![19, 20, 21, 22, 23]);
    assert!(page.has_previous);
    assert!(!page.has_next);
}

#[tokio::test]
async fn test_page_size_zero_serves_everything_at_once() {
    let db = seeded_db().await;
    let paginator = Paginator::new(ordered(), 0).unwrap();

    assert_eq!(paginator.get_amount_pages(&db).await.unwrap(), 1);
    let page = paginator.get_page(&db, 1).await.unwrap();
    assert_eq!(page.items.len(), 23);
    assert!(!page.has_next);

    assert!(matches!(
        paginator.get_page(&db, 2).await.unwrap_err(),
        OrmError::InvalidPage(_)
    ));
}

#[tokio::test]
async fn test_page_iterator_walks_and_restarts() {
    let db = seeded_db().await;
    let paginator = Paginator::new(ordered(), 5).unwrap();
    let mut iter = paginator.paginate();

    let mut seen = Vec::new();
    let mut pages = 0;
    while let Some(page) = iter.next(&db).await.unwrap() {
        seen.extend(page_ids(&page.items));
        pages += 1;
    }
    assert_eq!(pages, 5);
    assert_eq!(seen, (1..=23).collect::<Vec<i64>>());

    iter.restart();
    let again = iter.next(&db).await.unwrap().unwrap();
    assert_eq!(page_ids(&again.items), vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_reverse_paginator_identity() {
    let db = seeded_db().await;

    let forward = Paginator::new(ordered(), 5).unwrap();
    let backward = forward.get_reverse_paginator();
    assert!(Arc::ptr_eq(&backward.get_reverse_paginator(), &forward));

    let reversed_first = backward.get_page(&db, 1).await.unwrap();
    assert_eq!(page_ids(&reversed_first.items), vec![23, 22, 21, 20, 19]);

    let forward_cursor = CursorPaginator::new(ordered(), 5).unwrap();
    let backward_cursor = forward_cursor.get_reverse_paginator();
    assert!(Arc::ptr_eq(
        &backward_cursor.get_reverse_paginator(),
        &forward_cursor
    ));
}

// ----- cursor pagination ----------------------------------------------------

#[tokio::test]
async fn test_cursor_walk_has_no_gaps_or_overlap() {
    let db = seeded_db().await;
    let paginator = CursorPaginator::new(ordered(), 5).unwrap();

    let first = paginator.get_page(&db, None, false).await.unwrap();
    assert_eq!(page_ids(&first.items), vec![1, 2, 3, 4, 5]);
    assert_eq!(first.next_cursor, Some(Cursor::Single(Value::Int(5))));

    let mut iter = paginator.paginate(false);
    let mut seen = Vec::new();
    while let Some(page) = iter.next(&db).await.unwrap() {
        seen.extend(page_ids(&page.items));
    }
    assert_eq!(seen, (1..=23).collect::<Vec<i64>>());
}

#[tokio::test]
async fn test_cursor_position_is_a_key_not_an_offset() {
    let db = SqliteBackend::memory().unwrap();
    db.execute_batch(
        "CREATE TABLE tracks (
             id INTEGER PRIMARY KEY,
             title TEXT NOT NULL,
             rank INTEGER NOT NULL
         );",
    )
    .await
    .unwrap();
    // Zero-based, gapless keys.
    for i in 0..10 {
        db.execute_sql(
            "INSERT INTO tracks (id, title, rank) VALUES (?, ?, ?)",
            &[Value::Int(i), Value::from(format!("t{i}")), Value::Int(0)],
        )
        .await
        .unwrap();
    }

    let paginator = CursorPaginator::new(ordered(), 3).unwrap();
    // The cursor names the last key already seen, so resuming from key 1
    // leaves out both rows 0 and 1.
    let cursor = Cursor::Single(Value::Int(1));
    let page = paginator.get_page(&db, Some(&cursor), false).await.unwrap();
    assert_eq!(page_ids(&page.items), vec![2, 3, 4]);

    // The same holds with no page limit at all.
    let unpaged = CursorPaginator::new(ordered(), 0).unwrap();
    let rest = unpaged.get_page(&db, Some(&cursor), false).await.unwrap();
    assert_eq!(page_ids(&rest.items), (2..=9).collect::<Vec<i64>>());
    assert!(!rest.has_next);
    assert!(rest.next_cursor.is_none());
}

#[tokio::test]
async fn test_composite_cursor_crosses_duplicate_groups() {
    let db = seeded_db().await;
    let qs = QuerySet::<Track>::new().order_by(&["rank", "id"]);
    let paginator = CursorPaginator::new(qs, 3).unwrap();

    // Page one ends inside the rank-0 group.
    let first = paginator.get_page(&db, None, false).await.unwrap();
    assert_eq!(page_ids(&first.items), vec![1, 2, 3]);
    assert_eq!(
        first.next_cursor,
        Some(Cursor::Composite(vec![Value::Int(0), Value::Int(3)]))
    );

    // The tuple comparison picks up the rest of the group, not the next rank.
    let second = paginator
        .get_page(&db, first.next_cursor.as_ref(), false)
        .await
        .unwrap();
    assert_eq!(page_ids(&second.items), vec![4, 5, 6]);

    let mut iter = paginator.paginate(false);
    let mut seen = Vec::new();
    while let Some(page) = iter.next(&db).await.unwrap() {
        seen.extend(page_ids(&page.items));
    }
    assert_eq!(seen, (1..=23).collect::<Vec<i64>>());
}

#[tokio::test]
async fn test_cursor_arity_must_match_ordering() {
    let db = seeded_db().await;
    let qs = QuerySet::<Track>::new().order_by(&["rank", "id"]);
    let paginator = CursorPaginator::new(qs, 3).unwrap();

    let short = Cursor::Single(Value::Int(3));
    let err = paginator
        .get_page(&db, Some(&short), false)
        .await
        .unwrap_err();
    assert!(matches!(err, OrmError::InvalidPage(_)));
}

#[tokio::test]
async fn test_backward_cursor_traversal() {
    let db = seeded_db().await;
    let paginator = CursorPaginator::new(ordered(), 5).unwrap();

    // Backward from the start means the tail of the sequence, presented in
    // forward order.
    let tail = paginator.get_page(&db, None, true).await.unwrap();
    assert_eq!(page_ids(&tail.items), vec![19, 20, 21, 22, 23]);
    assert!(tail.has_next);
    assert_eq!(tail.next_cursor, Some(Cursor::Single(Value::Int(19))));

    let earlier = paginator
        .get_page(&db, tail.next_cursor.as_ref(), true)
        .await
        .unwrap();
    assert_eq!(page_ids(&earlier.items), vec![14, 15, 16, 17, 18]);

    // Sibling links follow presentation order after the re-reversal.
    assert_eq!(earlier.items[0].next.as_ref().unwrap().id, 15);
}

#[tokio::test]
async fn test_unordered_queryset_is_rejected() {
    let plain = QuerySet::<Track>::new();
    assert!(matches!(
        Paginator::new(plain.clone(), 5).err(),
        Some(OrmError::Configuration(_))
    ));
    assert!(matches!(
        CursorPaginator::new(plain, 5).err(),
        Some(OrmError::Configuration(_))
    ));
}
