//! End-to-end queryset execution against an in-memory SQLite database.
//!
//! A small blog schema (authors, articles, tags, and an article/tag
//! intermediate table) exercises lookups, joins, eager and batched relation
//! loading, projections, set operations, and the write paths.

use std::sync::LazyLock;

use marrow_db::fields::{FieldDef, FieldType};
use marrow_db::model::{Model, ModelMeta};
use marrow_db::value::{Arg, Row, Value};
use marrow_db::{
    refresh_model, DbExecutor, ModelLifecycleHooks, OrmError, OrmResult, Prefetch, Q, QuerySet,
};
use marrow_db_backends::{DatabaseBackend, SqliteBackend};

// ----- models ---------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct Author {
    id: i64,
    name: String,
    api_key: Option<String>,
}

fn author_meta() -> &'static ModelMeta {
    static META: LazyLock<ModelMeta> = LazyLock::new(|| ModelMeta {
        table: "authors",
        fields: vec![
            FieldDef::new("id", FieldType::BigAuto).primary_key(),
            FieldDef::new("name", FieldType::Char),
            FieldDef::new("api_key", FieldType::Char).null().secret(),
            FieldDef::reverse_foreign_key("articles", "author_id", article_meta),
        ],
    });
    &META
}

impl Model for Author {
    fn meta() -> &'static ModelMeta {
        author_meta()
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
            ("name", Value::String(self.name.clone())),
            ("api_key", Value::from(self.api_key.clone())),
        ]
    }
    fn from_row(row: &Row) -> OrmResult<Self> {
        Ok(Self {
            id: row.get::<Option<i64>>("id")?.unwrap_or_default(),
            name: row.get::<Option<String>>("name")?.unwrap_or_default(),
            api_key: row.get("api_key")?,
        })
    }
}

#[async_trait::async_trait]
impl ModelLifecycleHooks for Author {}

#[derive(Debug, Clone, Default)]
struct Article {
    id: i64,
    title: String,
    body: Option<String>,
    rating: i64,
    author_id: i64,
}

fn article_meta() -> &'static ModelMeta {
    static META: LazyLock<ModelMeta> = LazyLock::new(|| ModelMeta {
        table: "articles",
        fields: vec![
            FieldDef::new("id", FieldType::BigAuto).primary_key(),
            FieldDef::new("title", FieldType::Char),
            FieldDef::new("body", FieldType::Text).null(),
            FieldDef::new("rating", FieldType::Integer),
            FieldDef::foreign_key("author", "author_id", author_meta),
            FieldDef::many_to_many("tags", "article_tags", "article_id", "tag_id", tag_meta),
        ],
    });
    &META
}

impl Model for Article {
    fn meta() -> &'static ModelMeta {
        article_meta()
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
            ("body", Value::from(self.body.clone())),
            ("rating", Value::Int(self.rating)),
            ("author_id", Value::Int(self.author_id)),
        ]
    }
    fn from_row(row: &Row) -> OrmResult<Self> {
        Ok(Self {
            id: row.get::<Option<i64>>("id")?.unwrap_or_default(),
            title: row.get::<Option<String>>("title")?.unwrap_or_default(),
            body: row.get("body")?,
            rating: row.get::<Option<i64>>("rating")?.unwrap_or_default(),
            author_id: row.get::<Option<i64>>("author_id")?.unwrap_or_default(),
        })
    }
}

#[async_trait::async_trait]
impl ModelLifecycleHooks for Article {}

#[derive(Debug, Clone, Default)]
struct Tag {
    id: i64,
    label: String,
}

fn tag_meta() -> &'static ModelMeta {
    static META: LazyLock<ModelMeta> = LazyLock::new(|| ModelMeta {
        table: "tags",
        fields: vec![
            FieldDef::new("id", FieldType::BigAuto).primary_key(),
            FieldDef::new("label", FieldType::Char),
        ],
    });
    &META
}

impl Model for Tag {
    fn meta() -> &'static ModelMeta {
        tag_meta()
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
            ("label", Value::String(self.label.clone())),
        ]
    }
    fn from_row(row: &Row) -> OrmResult<Self> {
        Ok(Self {
            id: row.get::<Option<i64>>("id")?.unwrap_or_default(),
            label: row.get::<Option<String>>("label")?.unwrap_or_default(),
        })
    }
}

#[async_trait::async_trait]
impl ModelLifecycleHooks for Tag {
    async fn pre_save(&mut self, _db: &dyn DbExecutor) -> OrmResult<()> {
        self.label = self.label.to_lowercase();
        Ok(())
    }
}

// ----- fixtures -------------------------------------------------------------

const SCHEMA_DDL: &str = "
    CREATE TABLE authors (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        api_key TEXT
    );
    CREATE TABLE articles (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT NOT NULL,
        body TEXT,
        rating INTEGER NOT NULL DEFAULT 0,
        author_id INTEGER NOT NULL REFERENCES authors(id)
    );
    CREATE TABLE tags (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        label TEXT NOT NULL
    );
    CREATE TABLE article_tags (
        article_id INTEGER NOT NULL REFERENCES articles(id),
        tag_id INTEGER NOT NULL REFERENCES tags(id)
    );
";

fn article(title: &str, body: Option<&str>, rating: i64, author_id: i64) -> Article {
    Article {
        id: 0,
        title: title.to_string(),
        body: body.map(str::to_string),
        rating,
        author_id,
    }
}

/// Builds an in-memory database seeded with:
///
/// - authors: 1 Ada (api_key set), 2 Brian (api_key NULL)
/// - articles: 1 "Borrow checker basics" (r5, Ada), 2 "Lifetimes in practice"
///   (r4, Ada, no body), 3 "100% safe abstractions" (r3, Brian),
///   4 "Async pitfalls" (r2, Brian, no body), 5 "100 proof" (r1, Brian)
/// - tags: 1 rust, 2 async, 3 unsafe; article 1 → rust, article 3 → rust +
///   unsafe, article 4 → async
async fn seeded_db() -> SqliteBackend {
    let db = SqliteBackend::memory().unwrap();
    db.execute_batch(SCHEMA_DDL).await.unwrap();

    let authors = QuerySet::<Author>::new();
    let ada = authors
        .create(
            &db,
            Author {
                id: 0,
                name: "Ada".to_string(),
                api_key: Some("k-ada".to_string()),
            },
        )
        .await
        .unwrap();
    let brian = authors
        .create(
            &db,
            Author {
                id: 0,
                name: "Brian".to_string(),
                api_key: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(ada.id, 1);
    assert_eq!(brian.id, 2);

    let articles = QuerySet::<Article>::new();
    articles
        .bulk_create(
            &db,
            vec![
                article("Borrow checker basics", Some("moves and borrows"), 5, ada.id),
                article("Lifetimes in practice", None, 4, ada.id),
                article("100% safe abstractions", Some("encapsulation"), 3, brian.id),
                article("Async pitfalls", None, 2, brian.id),
                article("100 proof", Some("distillation"), 1, brian.id),
            ],
        )
        .await
        .unwrap();

    let tags = QuerySet::<Tag>::new();
    for label in ["rust", "async", "unsafe"] {
        tags.create(
            &db,
            Tag {
                id: 0,
                label: label.to_string(),
            },
        )
        .await
        .unwrap();
    }
    for (article_id, tag_id) in [(1, 1), (3, 1), (3, 3), (4, 2)] {
        db.execute_sql(
            "INSERT INTO article_tags (article_id, tag_id) VALUES (?, ?)",
            &[Value::Int(article_id), Value::Int(tag_id)],
        )
        .await
        .unwrap();
    }

    db
}

// ----- lookups and filtering ------------------------------------------------

#[tokio::test]
async fn test_basic_lookups() {
    let db = seeded_db().await;
    let qs = QuerySet::<Article>::new();

    let exact = qs.clone().filter_by("rating", 5).fetch(&db).await.unwrap();
    assert_eq!(exact.len(), 1);
    assert_eq!(exact[0].title, "Borrow checker basics");

    let gte = qs
        .clone()
        .filter(Q::expr("rating__gte", 4))
        .order_by(&["id"])
        .fetch(&db)
        .await
        .unwrap();
    assert_eq!(gte.len(), 2);
    assert_eq!(gte[1].title, "Lifetimes in practice");

    let within = qs
        .clone()
        .filter(Q::expr("rating__in", vec![Value::Int(2), Value::Int(5)]))
        .count(&db)
        .await
        .unwrap();
    assert_eq!(within, 2);

    let icontains = qs
        .clone()
        .filter(Q::expr("title__icontains", "LIFETIMES"))
        .fetch(&db)
        .await
        .unwrap();
    assert_eq!(icontains.len(), 1);

    let prefixed = qs
        .clone()
        .filter(Q::expr("title__startswith", "Borrow"))
        .exists(&db)
        .await
        .unwrap();
    assert!(prefixed);

    let bodyless = qs
        .filter(Q::expr("body__isnull", true))
        .count(&db)
        .await
        .unwrap();
    assert_eq!(bodyless, 2);
}

#[tokio::test]
async fn test_contains_escapes_like_metacharacters() {
    let db = seeded_db().await;
    // Two titles start with "100"; only one holds a literal percent sign.
    let found = QuerySet::<Article>::new()
        .filter(Q::expr("title__contains", "100%"))
        .fetch(&db)
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].title, "100% safe abstractions");
}

#[tokio::test]
async fn test_exclude_and_boolean_composition() {
    let db = seeded_db().await;
    let qs = QuerySet::<Article>::new();

    let kept = qs
        .clone()
        .exclude(Q::expr("rating__lte", 2))
        .count(&db)
        .await
        .unwrap();
    assert_eq!(kept, 3);

    let either = qs
        .filter(Q::expr("rating", 5) | Q::expr("title__endswith", "pitfalls"))
        .order_by(&["id"])
        .fetch(&db)
        .await
        .unwrap();
    let titles: Vec<&str> = either.iter().map(|a| a.title.as_str()).collect();
    assert_eq!(titles, vec!["Borrow checker basics", "Async pitfalls"]);
}

#[tokio::test]
async fn test_filters_spanning_relations() {
    let db = seeded_db().await;

    let by_ada = QuerySet::<Article>::new()
        .filter(Q::expr("author__name", "Ada"))
        .count(&db)
        .await
        .unwrap();
    assert_eq!(by_ada, 2);

    // Reverse traversal fans out; DISTINCT collapses the duplicates.
    let prolific = QuerySet::<Author>::new()
        .filter(Q::expr("articles__rating__gte", 4))
        .distinct()
        .fetch(&db)
        .await
        .unwrap();
    assert_eq!(prolific.len(), 1);
    assert_eq!(prolific[0].name, "Ada");

    let tagged_rust = QuerySet::<Article>::new()
        .filter(Q::expr("tags__label", "rust"))
        .order_by(&["id"])
        .fetch(&db)
        .await
        .unwrap();
    let ids: Vec<i64> = tagged_rust.iter().map(|a| a.id).collect();
    assert_eq!(ids, vec![1, 3]);
}

#[tokio::test]
async fn test_lazy_filter_argument_resolves_at_fetch() {
    let db = seeded_db().await;
    let threshold = Arg::lazy(|| async { Ok(Value::Int(4)) });
    let rows = QuerySet::<Article>::new()
        .filter(Q::expr("rating__gte", threshold))
        .count(&db)
        .await
        .unwrap();
    assert_eq!(rows, 2);
}

// ----- eager and batched relation loading -----------------------------------

#[tokio::test]
async fn test_select_related_materializes_joined_rows() {
    let db = seeded_db().await;
    let items = QuerySet::<Article>::new()
        .select_related(&["author"])
        .order_by(&["id"])
        .fetch(&db)
        .await
        .unwrap();
    assert_eq!(items.len(), 5);

    let first_author: Author = items[0].related_as("author").unwrap().unwrap();
    assert_eq!(first_author.name, "Ada");
    let last_author: Author = items[4].related_as("author").unwrap().unwrap();
    assert_eq!(last_author.name, "Brian");
}

#[tokio::test]
async fn test_prefetch_forward_foreign_key() {
    let db = seeded_db().await;
    let items = QuerySet::<Article>::new()
        .prefetch_related(Prefetch::new("author"))
        .unwrap()
        .order_by(&["id"])
        .fetch(&db)
        .await
        .unwrap();

    let authors: Vec<Author> = items[0].prefetched_as("author").unwrap();
    assert_eq!(authors.len(), 1);
    assert_eq!(authors[0].name, "Ada");
}

#[tokio::test]
async fn test_prefetch_reverse_foreign_key() {
    let db = seeded_db().await;
    let items = QuerySet::<Author>::new()
        .prefetch_related(Prefetch::new("articles").order_by(&["-rating"]))
        .unwrap()
        .order_by(&["id"])
        .fetch(&db)
        .await
        .unwrap();

    let ada_articles: Vec<Article> = items[0].prefetched_as("articles").unwrap();
    let ratings: Vec<i64> = ada_articles.iter().map(|a| a.rating).collect();
    assert_eq!(ratings, vec![5, 4]);

    let brian_articles: Vec<Article> = items[1].prefetched_as("articles").unwrap();
    assert_eq!(brian_articles.len(), 3);
}

#[tokio::test]
async fn test_prefetch_many_to_many() {
    let db = seeded_db().await;
    let items = QuerySet::<Article>::new()
        .prefetch_related(Prefetch::new("tags").order_by(&["label"]))
        .unwrap()
        .order_by(&["id"])
        .fetch(&db)
        .await
        .unwrap();

    let first_tags: Vec<Tag> = items[0].prefetched_as("tags").unwrap();
    assert_eq!(first_tags.len(), 1);
    assert_eq!(first_tags[0].label, "rust");

    let third_tags: Vec<Tag> = items[2].prefetched_as("tags").unwrap();
    let labels: Vec<&str> = third_tags.iter().map(|t| t.label.as_str()).collect();
    assert_eq!(labels, vec!["rust", "unsafe"]);

    // Article 2 carries no tags; the key still resolves, to an empty set.
    let second_tags: Vec<Tag> = items[1].prefetched_as("tags").unwrap();
    assert!(second_tags.is_empty());
}

#[tokio::test]
async fn test_prefetch_filter_and_rename() {
    let db = seeded_db().await;
    let items = QuerySet::<Author>::new()
        .prefetch_related(
            Prefetch::new("articles")
                .filter(Q::expr("rating__gte", 4))
                .to_attr("top_articles"),
        )
        .unwrap()
        .order_by(&["id"])
        .fetch(&db)
        .await
        .unwrap();

    let top: Vec<Article> = items[0].prefetched_as("top_articles").unwrap();
    assert_eq!(top.len(), 2);
    let brian_top: Vec<Article> = items[1].prefetched_as("top_articles").unwrap();
    assert!(brian_top.is_empty());
}

// ----- projections ----------------------------------------------------------

#[tokio::test]
async fn test_only_defers_columns_and_refresh_restores() {
    let db = seeded_db().await;
    let items = QuerySet::<Article>::new()
        .only(&["id", "title"])
        .unwrap()
        .filter_by("id", 1)
        .fetch(&db)
        .await
        .unwrap();

    let mut partial = (*items[0].shared()).clone();
    assert_eq!(partial.title, "Borrow checker basics");
    assert_eq!(partial.rating, 0);
    assert!(partial.body.is_none());

    refresh_model(&mut partial, &db).await.unwrap();
    assert_eq!(partial.rating, 5);
    assert_eq!(partial.body.as_deref(), Some("moves and borrows"));
}

#[tokio::test]
async fn test_defer_drops_named_columns() {
    let db = seeded_db().await;
    let items = QuerySet::<Article>::new()
        .defer(&["body"])
        .unwrap()
        .filter_by("id", 3)
        .fetch(&db)
        .await
        .unwrap();
    assert_eq!(items[0].title, "100% safe abstractions");
    assert!(items[0].body.is_none());
    assert!(!items[0].row().has_column("body"));
}

#[tokio::test]
async fn test_exclude_secrets_strips_secret_columns() {
    let db = seeded_db().await;
    let qs = QuerySet::<Author>::new().order_by(&["id"]);

    let open = qs.clone().fetch(&db).await.unwrap();
    assert_eq!(open[0].api_key.as_deref(), Some("k-ada"));

    let hidden = qs.exclude_secrets(true).fetch(&db).await.unwrap();
    assert!(hidden[0].api_key.is_none());
    assert!(!hidden[0].row().has_column("api_key"));
}

#[tokio::test]
async fn test_values_and_values_list() {
    let db = seeded_db().await;
    let qs = QuerySet::<Article>::new().order_by(&["id"]);

    let maps = qs
        .values(&db, Some(&["title", "rating"]), None, false)
        .await
        .unwrap();
    assert_eq!(maps.len(), 5);
    assert_eq!(maps[0]["title"], Value::String("Borrow checker basics".to_string()));
    assert_eq!(maps[0]["rating"], Value::Int(5));

    // exclude_none drops NULL entries from the mapping.
    let sparse = qs
        .values(&db, Some(&["title", "body"]), None, true)
        .await
        .unwrap();
    assert!(!sparse[1].contains_key("body"));
    assert!(sparse[0].contains_key("body"));

    let pairs = qs.values_list(&db, &["id", "rating"]).await.unwrap();
    assert_eq!(pairs[0], vec![Value::Int(1), Value::Int(5)]);

    let titles = qs.values_list_flat(&db, &["title"]).await.unwrap();
    assert_eq!(titles.len(), 5);
    assert_eq!(titles[4], Value::String("100 proof".to_string()));

    let err = qs.values_list_flat(&db, &["id", "title"]).await.unwrap_err();
    assert!(matches!(err, OrmError::QuerySet(_)));
}

// ----- set operations -------------------------------------------------------

#[tokio::test]
async fn test_union_deduplicates_overlap() {
    let db = seeded_db().await;
    let high = QuerySet::<Article>::new().filter(Q::expr("rating__gte", 3));
    let higher = QuerySet::<Article>::new().filter(Q::expr("rating__gte", 4));

    let distinct_union = high
        .clone()
        .union(higher.clone())
        .unwrap()
        .count(&db)
        .await
        .unwrap();
    assert_eq!(distinct_union, 3);

    let with_duplicates = high
        .clone()
        .union_all(higher.clone())
        .unwrap()
        .count(&db)
        .await
        .unwrap();
    assert_eq!(with_duplicates, 5);

    // Outer DISTINCT restores set semantics over UNION ALL.
    let deduplicated = high
        .union_all(higher)
        .unwrap()
        .distinct()
        .count(&db)
        .await
        .unwrap();
    assert_eq!(deduplicated, 3);
}

#[tokio::test]
async fn test_intersect_except_and_outer_ordering() {
    let db = seeded_db().await;
    let by_brian = QuerySet::<Article>::new().filter(Q::expr("author__name", "Brian"));
    let low = QuerySet::<Article>::new().filter(Q::expr("rating__lte", 2));

    let both = by_brian
        .clone()
        .intersect(low.clone())
        .unwrap()
        .order_by(&["title"])
        .fetch(&db)
        .await
        .unwrap();
    let titles: Vec<&str> = both.iter().map(|a| a.title.as_str()).collect();
    assert_eq!(titles, vec!["100 proof", "Async pitfalls"]);

    let brian_only_high = by_brian
        .except_(low)
        .unwrap()
        .fetch(&db)
        .await
        .unwrap();
    assert_eq!(brian_only_high.len(), 1);
    assert_eq!(brian_only_high[0].title, "100% safe abstractions");
}

// ----- single-row terminals -------------------------------------------------

#[tokio::test]
async fn test_get_error_taxonomy() {
    let db = seeded_db().await;
    let qs = QuerySet::<Article>::new();

    let one = qs.get(&db, Q::expr("rating", 5)).await.unwrap();
    assert_eq!(one.title, "Borrow checker basics");

    let missing = qs.get(&db, Q::expr("rating", 99)).await.unwrap_err();
    assert!(matches!(missing, OrmError::DoesNotExist(_)));

    let ambiguous = qs.get(&db, Q::expr("rating__gte", 4)).await.unwrap_err();
    assert!(matches!(ambiguous, OrmError::MultipleObjectsReturned(_)));

    assert!(qs
        .get_or_none(&db, Q::expr("rating", 99))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_first_last_and_contains() {
    let db = seeded_db().await;
    let qs = QuerySet::<Article>::new().order_by(&["rating"]);

    let first = qs.first(&db).await.unwrap().unwrap();
    assert_eq!(first.title, "100 proof");
    let last = qs.last(&db).await.unwrap().unwrap();
    assert_eq!(last.title, "Borrow checker basics");

    let saved = Article {
        id: 1,
        ..Article::default()
    };
    assert!(QuerySet::<Article>::new().contains(&db, &saved).await.unwrap());
    assert!(!QuerySet::<Article>::new()
        .filter(Q::expr("rating", 1))
        .contains(&db, &saved)
        .await
        .unwrap());
}

// ----- write paths ----------------------------------------------------------

#[tokio::test]
async fn test_create_runs_lifecycle_hooks() {
    let db = seeded_db().await;
    let tag = QuerySet::<Tag>::new()
        .create(
            &db,
            Tag {
                id: 0,
                label: "WASM".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(tag.id, 4);
    // pre_save normalized the label before the INSERT.
    assert_eq!(tag.label, "wasm");

    let stored = QuerySet::<Tag>::new()
        .get(&db, Q::expr("id", tag.id))
        .await
        .unwrap();
    assert_eq!(stored.label, "wasm");
}

#[tokio::test]
async fn test_bulk_update_writes_named_fields() {
    let db = seeded_db().await;
    let qs = QuerySet::<Article>::new().order_by(&["id"]);

    let mut articles: Vec<Article> = qs
        .clone()
        .filter(Q::expr("author__name", "Ada"))
        .fetch(&db)
        .await
        .unwrap()
        .iter()
        .map(|item| (*item.shared()).clone())
        .collect();
    for a in &mut articles {
        a.rating += 10;
    }
    let affected = qs
        .bulk_update(&db, &mut articles, &["rating"])
        .await
        .unwrap();
    assert_eq!(affected, 2);

    let ratings = qs
        .clone()
        .filter(Q::expr("author__name", "Ada"))
        .values_list_flat(&db, &["rating"])
        .await
        .unwrap();
    assert_eq!(ratings, vec![Value::Int(15), Value::Int(14)]);

    let err = qs
        .bulk_update(&db, &mut articles, &["nope"])
        .await
        .unwrap_err();
    assert!(matches!(err, OrmError::UnknownField(_)));
}

#[tokio::test]
async fn test_filtered_update_and_delete() {
    let db = seeded_db().await;
    let qs = QuerySet::<Article>::new();

    let updated = qs
        .clone()
        .filter(Q::expr("rating__lte", 2))
        .update(&db, &[("rating", Value::Int(0))])
        .await
        .unwrap();
    assert_eq!(updated, 2);

    let deleted = qs
        .clone()
        .filter(Q::expr("rating", 0))
        .delete(&db)
        .await
        .unwrap();
    assert_eq!(deleted, 2);
    assert_eq!(qs.count(&db).await.unwrap(), 3);
}

#[tokio::test]
async fn test_get_or_create_and_update_or_create() {
    let db = seeded_db().await;
    let qs = QuerySet::<Author>::new();

    let (existing, created) = qs
        .get_or_create(&db, Q::expr("name", "Ada"), || Author {
            id: 0,
            name: "Ada".to_string(),
            api_key: None,
        })
        .await
        .unwrap();
    assert!(!created);
    assert_eq!(existing.id, 1);

    let (fresh, created) = qs
        .get_or_create(&db, Q::expr("name", "Grace"), || Author {
            id: 0,
            name: "Grace".to_string(),
            api_key: None,
        })
        .await
        .unwrap();
    assert!(created);
    assert_eq!(fresh.id, 3);

    let (updated, created) = qs
        .update_or_create(
            &db,
            Q::expr("name", "Grace"),
            || Author::default(),
            |author| author.api_key = Some("k-grace".to_string()),
        )
        .await
        .unwrap();
    assert!(!created);
    assert_eq!(updated.id, fresh.id);

    let stored = qs.get(&db, Q::expr("name", "Grace")).await.unwrap();
    assert_eq!(stored.api_key.as_deref(), Some("k-grace"));
}

#[tokio::test]
async fn test_forced_rollback_writes_still_execute() {
    let db = seeded_db().await;
    db.set_force_rollback(true);

    // The mode only warns; within this connection the write is visible.
    let qs = QuerySet::<Tag>::new();
    qs.create(
        &db,
        Tag {
            id: 0,
            label: "ephemeral".to_string(),
        },
    )
    .await
    .unwrap();
    assert_eq!(qs.count(&db).await.unwrap(), 4);
}

// ----- caching and tenancy --------------------------------------------------

#[tokio::test]
async fn test_result_cache_replays_until_cleared() {
    let db = seeded_db().await;
    let qs = QuerySet::<Tag>::new().order_by(&["id"]);

    let first = qs.all(&db).await.unwrap();
    db.execute_sql(
        "INSERT INTO tags (label) VALUES (?)",
        &[Value::from("late")],
    )
    .await
    .unwrap();

    let replay = qs.all(&db).await.unwrap();
    assert!(std::sync::Arc::ptr_eq(&first, &replay));
    assert_eq!(replay.len(), 3);

    qs.clear_caches();
    let refreshed = qs.all(&db).await.unwrap();
    assert_eq!(refreshed.len(), 4);
}

#[tokio::test]
async fn test_using_schema_routes_to_attached_database() {
    let db = seeded_db().await;
    db.execute_batch(
        "ATTACH DATABASE ':memory:' AS tenant_b;
         CREATE TABLE tenant_b.authors (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             name TEXT NOT NULL,
             api_key TEXT
         );
         INSERT INTO tenant_b.authors (name) VALUES ('Zoe');",
    )
    .await
    .unwrap();

    let main_count = QuerySet::<Author>::new().count(&db).await.unwrap();
    assert_eq!(main_count, 2);

    let tenant = QuerySet::<Author>::new().using_schema("tenant_b");
    assert_eq!(tenant.count(&db).await.unwrap(), 1);
    let zoe = tenant.get(&db, Q::expr("name", "Zoe")).await.unwrap();
    assert_eq!(zoe.id, 1);
}
