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
fn abandoned_transaction_is_rolled_back() -> Result<(), Box<dyn std::error::Error>> {
    let rt = Runtime::new()?;
    let (pool, factory, sim) = setup(1);
    let handle = pool.handle();

    run(&rt, &sim, &handle, "BEGIN")?;
    let pinned = handle.pinned_connection().unwrap();
    assert_eq!(pool.idle_count(), 0);

    // The caller walks away mid-transaction.
    handle.release();

    // Release schedules a rollback on the pinned connection; drive it.
    sim.run_until_idle(10);

    assert_eq!(
        factory.log().count(|command| matches!(
            command,
            SentCommand::Raw { sql } if sql == "rollback"
        )),
        1
    );

    let connection = pool.connection(pinned).unwrap();
    assert!(!connection.in_transaction());
    assert_eq!(pool.idle_count(), 1);
    Ok(())
}

#[test]
fn failed_rollback_escalates_to_reset() -> Result<(), Box<dyn std::error::Error>> {
    let rt = Runtime::new()?;
    let (pool, factory, sim) = setup(1);
    factory.respond_with("rollback", ResultStatus::FatalError, "cannot roll back");
    let handle = pool.handle();

    run(&rt, &sim, &handle, "BEGIN")?;
    handle.release();
    sim.run_until_idle(10);

    // The rollback failed, so the connection was reset before release.
    assert_eq!(
        factory
            .log()
            .count(|command| matches!(command, SentCommand::Reset)),
        1
    );
    assert_eq!(pool.idle_count(), 1);
    Ok(())
}

#[test]
fn release_is_idempotent_and_blocks_new_work() -> Result<(), Box<dyn std::error::Error>> {
    let rt = Runtime::new()?;
    let (pool, _factory, sim) = setup(1);
    let handle = pool.handle();

    run(&rt, &sim, &handle, "SELECT 1")?;

    handle.release();
    handle.release();
    assert!(handle.is_released());

    let err = handle
        .async_query("SELECT 2", QueryParams::None, QueryFlags::new())
        .unwrap_err();
    assert!(matches!(err, Error::HandleReleased));

    let err = handle
        .sync_query("SELECT 2", QueryParams::None, QueryFlags::new())
        .unwrap_err();
    assert!(matches!(err, Error::HandleReleased));

    let err = handle.bind_connection().unwrap_err();
    assert!(matches!(err, Error::HandleReleased));

    assert_eq!(pool.idle_count(), 1);
    Ok(())
}

#[test]
fn dropping_the_handle_releases_it() -> Result<(), Box<dyn std::error::Error>> {
    let rt = Runtime::new()?;
    let (pool, factory, sim) = setup(1);

    {
        let handle = pool.handle();
        run(&rt, &sim, &handle, "BEGIN")?;
        assert_eq!(pool.idle_count(), 0);
    }

    // Drop ran the release hook, which rolled the transaction back.
    sim.run_until_idle(10);
    assert_eq!(
        factory.log().count(|command| matches!(
            command,
            SentCommand::Raw { sql } if sql == "rollback"
        )),
        1
    );
    assert_eq!(pool.idle_count(), 1);
    Ok(())
}

#[test]
fn bound_connection_is_dedicated_until_release() -> Result<(), Box<dyn std::error::Error>> {
    let rt = Runtime::new()?;
    let (pool, factory, sim) = setup(2);
    let handle = pool.handle();

    handle.bind_connection()?;
    let bound = handle.pinned_connection().expect("bind must pin");
    assert_eq!(pool.idle_count(), 1);

    // Binding twice keeps the same connection.
    handle.bind_connection()?;
    assert_eq!(handle.pinned_connection(), Some(bound));

    // Queries ride the bound connection even without a transaction.
    run(&rt, &sim, &handle, "LISTEN events")?;
    run(&rt, &sim, &handle, "LISTEN more_events")?;
    assert_eq!(handle.pinned_connection(), Some(bound));
    assert_eq!(pool.idle_count(), 1);
    assert_eq!(
        factory
            .log()
            .count(|c| matches!(c, SentCommand::Parameterized { .. })),
        2
    );

    handle.release();
    sim.run_until_idle(10);
    assert_eq!(pool.idle_count(), 2);
    Ok(())
}

#[test]
fn pending_transaction_queries_resolve_before_release() -> Result<(), Box<dyn std::error::Error>> {
    let rt = Runtime::new()?;
    let (pool, _factory, sim) = setup(1);
    let handle = pool.handle();

    run(&rt, &sim, &handle, "BEGIN")?;
    let waits: Vec<WaitHandle> = (0..3)
        .map(|i| {
            handle.async_query(
                &format!("UPDATE t SET a = {i}"),
                QueryParams::None,
                QueryFlags::new(),
            )
        })
        .collect::<Result<_, _>>()?;
    sim.run_until_idle(20);
    for wait in waits {
        rt.block_on(wait.wait())?;
    }
    run(&rt, &sim, &handle, "COMMIT")?;

    handle.release();
    sim.run_until_idle(10);
    assert_eq!(pool.idle_count(), 1);
    Ok(())
}
