use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

use allocd::tenant::TenantManager;
use allocd::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("allocd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "allocd".to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

async fn connect(addr: SocketAddr, dbname: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(dbname)
        .user("allocd")
        .password("allocd");
    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

/// Data rows of a simple query, each as column name → text value.
async fn rows(client: &Client, sql: &str) -> Vec<Vec<(String, Option<String>)>> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(
                row.columns()
                    .iter()
                    .enumerate()
                    .map(|(i, c)| (c.name().to_string(), row.get(i).map(str::to_string)))
                    .collect(),
            ),
            _ => None,
        })
        .collect()
}

fn col<'a>(row: &'a [(String, Option<String>)], name: &str) -> Option<&'a str> {
    row.iter()
        .find(|(n, _)| n == name)
        .and_then(|(_, v)| v.as_deref())
}

async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = client.batch_execute(sql).await.unwrap_err();
    err.code().map(|c| c.code().to_string()).unwrap_or_default()
}

struct Staff {
    employee: Ulid,
    project: Ulid,
}

async fn staff(client: &Client) -> Staff {
    let employee = Ulid::new();
    let project = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO employees (id, name) VALUES ('{employee}', 'Ada')"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO projects (id, name) VALUES ('{project}', 'Apollo')"
        ))
        .await
        .unwrap();
    Staff { employee, project }
}

async fn allocate(client: &Client, s: &Staff, start: i64, end: i64, force: bool) -> String {
    let returned = rows(
        client,
        &format!(
            "INSERT INTO allocations VALUES ('{}', '{}', NULL, {start}, {end}, {force}) RETURNING *",
            s.employee, s.project
        ),
    )
    .await;
    assert_eq!(returned.len(), 1);
    col(&returned[0], "id").unwrap().to_string()
}

fn window(s: &Staff, start: i64, end: i64) -> String {
    format!(
        r#"WHERE employee_id = '{}' AND start >= {start} AND "end" <= {end}"#,
        s.employee
    )
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn insert_returning_and_select() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "acme").await;
    let s = staff(&client).await;

    let id = allocate(&client, &s, 1000, 2000, false).await;

    let listed = rows(
        &client,
        &format!("SELECT * FROM allocations WHERE employee_id = '{}'", s.employee),
    )
    .await;
    assert_eq!(listed.len(), 1);
    assert_eq!(col(&listed[0], "id"), Some(id.as_str()));
    assert_eq!(col(&listed[0], "phase_id"), None);
    assert_eq!(col(&listed[0], "start"), Some("1000"));
    assert_eq!(col(&listed[0], "end"), Some("2000"));
}

#[tokio::test]
async fn overlapping_insert_is_rejected() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "acme").await;
    let s = staff(&client).await;
    allocate(&client, &s, 0, 100, false).await;

    let code = sqlstate(
        &client,
        &format!(
            "INSERT INTO allocations VALUES ('{}', '{}', NULL, 50, 150)",
            s.employee, s.project
        ),
    )
    .await;
    assert_eq!(code, "23P01");

    let code = sqlstate(
        &client,
        &format!(
            "INSERT INTO allocations VALUES ('{}', '{}', NULL, 150, 150)",
            s.employee, s.project
        ),
    )
    .await;
    assert_eq!(code, "22007");
}

#[tokio::test]
async fn unknown_references_are_rejected() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "acme").await;
    let code = sqlstate(
        &client,
        &format!(
            "INSERT INTO allocations VALUES ('{}', '{}', NULL, 0, 10)",
            Ulid::new(),
            Ulid::new()
        ),
    )
    .await;
    assert_eq!(code, "23503");
}

#[tokio::test]
async fn overlaps_and_override_plan() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "acme").await;
    let s = staff(&client).await;
    let head = allocate(&client, &s, 0, 100, false).await;
    let inner = allocate(&client, &s, 120, 140, false).await;

    let overlaps = rows(&client, &format!("SELECT * FROM overlaps {}", window(&s, 50, 150))).await;
    assert_eq!(overlaps.len(), 2);
    assert_eq!(col(&overlaps[0], "id"), Some(head.as_str()));
    assert_eq!(col(&overlaps[0], "kind"), Some("overlaps_start"));
    assert_eq!(col(&overlaps[1], "kind"), Some("contains"));

    let plan = rows(
        &client,
        &format!("SELECT * FROM override_plan {}", window(&s, 50, 150)),
    )
    .await;
    assert_eq!(plan.len(), 2);
    let action = |id: &str| {
        plan.iter()
            .find(|r| col(r, "id") == Some(id))
            .and_then(|r| col(r, "action"))
            .map(str::to_string)
    };
    assert_eq!(action(&inner).as_deref(), Some("delete"));
    assert_eq!(action(&head).as_deref(), Some("modify"));
    let modify = plan.iter().find(|r| col(r, "action") == Some("modify")).unwrap();
    assert_eq!(col(modify, "new_start"), Some("0"));
    assert_eq!(col(modify, "new_end"), Some("50"));

    // Planning never mutates
    let listed = rows(
        &client,
        &format!("SELECT * FROM allocations WHERE employee_id = '{}'", s.employee),
    )
    .await;
    assert_eq!(listed.len(), 2);
}

#[tokio::test]
async fn containing_allocation_blocks_override() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "acme").await;
    let s = staff(&client).await;
    let outer = allocate(&client, &s, 0, 1000, false).await;

    let plan = rows(
        &client,
        &format!("SELECT * FROM override_plan {}", window(&s, 100, 200)),
    )
    .await;
    assert_eq!(plan.len(), 1);
    assert_eq!(col(&plan[0], "action"), Some("conflict"));
    assert_eq!(col(&plan[0], "id"), Some(outer.as_str()));

    let code = sqlstate(
        &client,
        &format!(
            "INSERT INTO allocations VALUES ('{}', '{}', NULL, 100, 200, true)",
            s.employee, s.project
        ),
    )
    .await;
    assert_eq!(code, "23P01");
}

#[tokio::test]
async fn override_insert_truncates_and_deletes() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "acme").await;
    let s = staff(&client).await;
    allocate(&client, &s, 0, 100, false).await;
    allocate(&client, &s, 120, 140, false).await;
    allocate(&client, &s, 180, 300, false).await;

    let placed = allocate(&client, &s, 50, 200, true).await;

    let listed = rows(
        &client,
        &format!("SELECT * FROM allocations WHERE employee_id = '{}'", s.employee),
    )
    .await;
    let spans: Vec<(Option<&str>, Option<&str>)> = listed
        .iter()
        .map(|r| (col(r, "start"), col(r, "end")))
        .collect();
    assert_eq!(
        spans,
        vec![
            (Some("0"), Some("50")),
            (Some("50"), Some("200")),
            (Some("200"), Some("300")),
        ]
    );
    assert_eq!(col(&listed[1], "id"), Some(placed.as_str()));
}

#[tokio::test]
async fn delete_from_overlaps_clears_window() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "acme").await;
    let s = staff(&client).await;
    allocate(&client, &s, 0, 100, false).await;
    allocate(&client, &s, 120, 140, false).await;

    let done = client
        .simple_query(&format!("DELETE FROM overlaps {}", window(&s, 50, 150)))
        .await
        .unwrap();
    let touched = done.iter().find_map(|m| match m {
        SimpleQueryMessage::CommandComplete(n) => Some(*n),
        _ => None,
    });
    assert_eq!(touched, Some(2));

    let free = rows(&client, &format!("SELECT * FROM availability {}", window(&s, 0, 200))).await;
    let spans: Vec<(Option<&str>, Option<&str>)> =
        free.iter().map(|r| (col(r, "start"), col(r, "end"))).collect();
    assert_eq!(spans, vec![(Some("50"), Some("200"))]);
}

#[tokio::test]
async fn update_moves_allocation() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "acme").await;
    let s = staff(&client).await;
    let id = allocate(&client, &s, 0, 100, false).await;
    allocate(&client, &s, 200, 300, false).await;

    let moved = rows(
        &client,
        &format!(r#"UPDATE allocations SET start = 50, "end" = 150 WHERE id = '{id}' RETURNING *"#),
    )
    .await;
    assert_eq!(col(&moved[0], "start"), Some("50"));
    assert_eq!(col(&moved[0], "end"), Some("150"));

    let code = sqlstate(
        &client,
        &format!(r#"UPDATE allocations SET start = 50, "end" = 250 WHERE id = '{id}'"#),
    )
    .await;
    assert_eq!(code, "23P01");
}

#[tokio::test]
async fn unassign_from_project() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "acme").await;
    let s = staff(&client).await;
    allocate(&client, &s, 0, 100, false).await;
    allocate(&client, &s, 200, 300, false).await;

    let removed = client
        .execute(
            "DELETE FROM allocations WHERE employee_id = $1 AND project_id = $2",
            &[&s.employee.to_string(), &s.project.to_string()],
        )
        .await
        .unwrap();
    assert_eq!(removed, 2);

    let listed = rows(
        &client,
        &format!("SELECT * FROM allocations WHERE employee_id = '{}'", s.employee),
    )
    .await;
    assert!(listed.is_empty());
}

#[tokio::test]
async fn extended_protocol_parameters() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "acme").await;
    let employee = Ulid::new().to_string();

    let inserted = client
        .execute(
            "INSERT INTO employees (id, name) VALUES ($1, $2)",
            &[&employee, &"O'Brien"],
        )
        .await
        .unwrap();
    assert_eq!(inserted, 1);

    let err = client
        .execute(
            "INSERT INTO employees (id, name) VALUES ($1, $2)",
            &[&employee, &"Again"],
        )
        .await
        .unwrap_err();
    assert_eq!(err.code().map(|c| c.code()), Some("23505"));
}

#[tokio::test]
async fn tenants_are_isolated() {
    let (addr, tm) = start_test_server().await;
    let a = connect(addr, "tenant_a").await;
    let b = connect(addr, "tenant_b").await;

    let s = staff(&a).await;
    allocate(&a, &s, 0, 100, false).await;

    let listed = rows(
        &b,
        &format!("SELECT * FROM allocations WHERE employee_id = '{}'", s.employee),
    )
    .await;
    assert!(listed.is_empty());
    assert_eq!(tm.tenant_count(), 2);
}

#[tokio::test]
async fn syntax_errors_use_42601() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "acme").await;
    assert_eq!(sqlstate(&client, "SELECT * FROM bookings WHERE x = 1").await, "42601");
    assert_eq!(sqlstate(&client, "NOT SQL AT ALL").await, "42601");
}
