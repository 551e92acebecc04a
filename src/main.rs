use std::{sync::Arc, time::Duration};

use comet_sync::{
    deflation::MonitorDeflationThread, header::ObjectHeader, Config, ObjectRef,
    ObjectSynchronizer, WaitStatus,
};

fn main() {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()
        .unwrap();

    let mut config = Config::default().adjusted_for_host();
    config.verbose = true;
    config.guaranteed_safepoint_interval_ms = 100;
    let sync = ObjectSynchronizer::new(config);
    let deflater = MonitorDeflationThread::start(sync.clone()).unwrap();

    let objects: Arc<Vec<ObjectHeader>> = Arc::new((0..64).map(|_| ObjectHeader::new()).collect());

    let workers: Vec<_> = (0..4)
        .map(|n| {
            let sync = sync.clone();
            let objects = objects.clone();
            std::thread::spawn(move || {
                for i in 0..10_000 {
                    let object = &objects[(i * 7 + n) % objects.len()];
                    let guard = sync.lock(object).unwrap();
                    if i % 1000 == 0 {
                        assert_eq!(guard.wait(1).unwrap(), WaitStatus::TimedOut);
                    }
                    guard.unlock().unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let hash = unsafe { sync.identity_hash(ObjectRef::new(&objects[0])) }.unwrap();
    println!("identity hash of object 0: {:#x}", hash);
    println!("monitors in use after workload: {}", sync.in_use_count());

    std::thread::sleep(Duration::from_millis(300));
    sync.request_deflate_idle_monitors();
    println!("monitors in use after deflation: {}", sync.in_use_count());
    println!("{}", sync.statistics());

    deflater.join();
}
