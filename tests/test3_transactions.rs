use std::sync::Arc;

use enigma_pool::prelude::*;
use tokio::runtime::Runtime;

fn setup(pool_size: usize) -> (Arc<Pool>, Arc<ScriptedFactory>, Arc<SimLoop>) {
    let factory = Arc::new(ScriptedFactory::new());
    let sim = SimLoop::new();
    let conn_opts: ConnectionOptions = [("host", "db"), ("dbname", "app")].into_iter().collect();
    let options = PoolOptionsBuilder::new().pool_size(pool_size).build().unwrap();
    let pool = Pool::new(
        conn_opts,
        options,
        Arc::clone(&factory) as Arc<dyn WireFactory>,
        Arc::clone(&sim) as Arc<dyn EventLoop>,
    )
    .unwrap();
    (pool, factory, sim)
}

fn run(
    rt: &Runtime,
    sim: &SimLoop,
    handle: &PoolHandle,
    sql: &str,
) -> Result<(), enigma_pool::Error> {
    let wait = handle.async_query(sql, QueryParams::None, QueryFlags::new())?;
    sim.run_until_idle(10);
    rt.block_on(wait.wait()).map(|_| ())
}

#[test]
fn transaction_pins_one_connection() -> Result<(), Box<dyn std::error::Error>> {
    let rt = Runtime::new()?;
    let (pool, _factory, sim) = setup(3);
    let handle = pool.handle();

    assert_eq!(pool.idle_count(), 3);
    assert_eq!(handle.pinned_connection(), None);

    run(&rt, &sim, &handle, "BEGIN")?;
    let pinned = handle.pinned_connection().expect("BEGIN must pin");
    // The pinned connection is out of the shared idle queue.
    assert_eq!(pool.idle_count(), 2);

    run(&rt, &sim, &handle, "INSERT INTO t VALUES (1)")?;
    assert_eq!(handle.pinned_connection(), Some(pinned));
    assert_eq!(pool.idle_count(), 2);

    run(&rt, &sim, &handle, "COMMIT")?;
    assert_eq!(handle.pinned_connection(), None);
    // After COMMIT the connection returns to the idle queue.
    assert_eq!(pool.idle_count(), 3);

    // A subsequent independent query may use any connection again.
    run(&rt, &sim, &handle, "SELECT 1")?;
    assert_eq!(handle.pinned_connection(), None);
    assert_eq!(pool.idle_count(), 3);
    Ok(())
}

#[test]
fn intra_transaction_queries_are_serialized_fifo() -> Result<(), Box<dyn std::error::Error>> {
    let rt = Runtime::new()?;
    let (pool, factory, sim) = setup(2);
    let handle = pool.handle();

    run(&rt, &sim, &handle, "BEGIN")?;
    assert!(handle.pinned_connection().is_some());

    // Submit several queries without ticking; the first executes on the
    // pinned connection, the rest wait in the handle's own queue, never in
    // the shared one.
    let waits: Vec<WaitHandle> = (0..4)
        .map(|i| {
            handle.async_query(
                &format!("UPDATE t SET a = {i}"),
                QueryParams::None,
                QueryFlags::new(),
            )
        })
        .collect::<Result<_, _>>()?;
    assert_eq!(pool.queued_count(), 0);

    sim.run_until_idle(20);
    for wait in waits {
        rt.block_on(wait.wait())?;
    }

    let sqls: Vec<String> = factory
        .log()
        .commands()
        .into_iter()
        .filter_map(|command| match command {
            SentCommand::Parameterized { sql, .. } => Some(sql),
            _ => None,
        })
        .collect();
    assert_eq!(
        sqls,
        vec![
            "BEGIN",
            "UPDATE t SET a = 0",
            "UPDATE t SET a = 1",
            "UPDATE t SET a = 2",
            "UPDATE t SET a = 3",
        ]
    );

    run(&rt, &sim, &handle, "COMMIT")?;
    assert_eq!(pool.idle_count(), 2);
    Ok(())
}

#[test]
fn transaction_queue_overflow_is_synchronous() -> Result<(), Box<dyn std::error::Error>> {
    let rt = Runtime::new()?;
    let (pool, factory, sim) = setup(1);
    let handle = pool.handle();

    run(&rt, &sim, &handle, "BEGIN")?;

    // One query executes on the pinned connection; ten fit in the handle's
    // transaction queue; the next submission overflows.
    factory.hold("UPDATE");
    let mut waits = Vec::new();
    for i in 0..11 {
        waits.push(handle.async_query(
            &format!("UPDATE t SET a = {i}"),
            QueryParams::None,
            QueryFlags::new(),
        )?);
    }
    let err = handle
        .async_query("UPDATE t SET a = 11", QueryParams::None, QueryFlags::new())
        .unwrap_err();
    assert!(matches!(err, Error::TransactionQueueFull));

    factory.release("UPDATE");
    sim.run_until_idle(40);
    for wait in waits {
        rt.block_on(wait.wait())?;
    }

    run(&rt, &sim, &handle, "COMMIT")?;
    assert_eq!(pool.idle_count(), 1);
    Ok(())
}

#[test]
fn failed_statement_keeps_the_transaction_pinned() -> Result<(), Box<dyn std::error::Error>> {
    let rt = Runtime::new()?;
    let (pool, factory, sim) = setup(2);
    factory.respond_with("broken", ResultStatus::FatalError, "syntax error");
    let handle = pool.handle();

    run(&rt, &sim, &handle, "BEGIN")?;
    let pinned = handle.pinned_connection().unwrap();

    // A failed statement leaves the server transaction in the error state;
    // the connection must stay pinned.
    let err = run(&rt, &sim, &handle, "SELECT broken").unwrap_err();
    assert!(matches!(err, Error::Query(_)));
    assert_eq!(handle.pinned_connection(), Some(pinned));
    assert_eq!(pool.idle_count(), 1);

    run(&rt, &sim, &handle, "ROLLBACK")?;
    assert_eq!(handle.pinned_connection(), None);
    assert_eq!(pool.idle_count(), 2);
    Ok(())
}

#[test]
fn sync_queries_participate_in_pinning() -> Result<(), Box<dyn std::error::Error>> {
    let (pool, factory, _sim) = setup(2);
    let handle = pool.handle();

    handle.sync_query("BEGIN", QueryParams::None, QueryFlags::new())?;
    let pinned = handle.pinned_connection().expect("BEGIN must pin");
    assert_eq!(pool.idle_count(), 1);

    handle.sync_query("INSERT INTO t VALUES (1)", QueryParams::None, QueryFlags::new())?;
    assert_eq!(handle.pinned_connection(), Some(pinned));

    handle.sync_query("COMMIT", QueryParams::None, QueryFlags::new())?;
    assert_eq!(handle.pinned_connection(), None);
    assert_eq!(pool.idle_count(), 2);

    let sqls: Vec<String> = factory
        .log()
        .commands()
        .into_iter()
        .filter_map(|command| match command {
            SentCommand::Parameterized { sql, .. } => Some(sql),
            _ => None,
        })
        .collect();
    assert_eq!(sqls, vec!["BEGIN", "INSERT INTO t VALUES (1)", "COMMIT"]);
    Ok(())
}
