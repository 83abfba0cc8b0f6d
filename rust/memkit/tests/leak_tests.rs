use std::io::Write;
use std::sync::{Arc, Mutex};

use memkit::{
    Allocate, Buffer, ErrorKind, LeakReportMode, LeakTrackingAllocator, SlabAllocator,
    SystemAllocator,
};

#[derive(Clone, Default)]
struct CaptureSink(Arc<Mutex<Vec<u8>>>);

impl Write for CaptureSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl CaptureSink {
    fn lines(&self) -> Vec<String> {
        String::from_utf8(self.0.lock().unwrap().clone())
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

#[test]
fn test_one_missing_release_is_one_leak_with_its_site() {
    let tracker = LeakTrackingAllocator::new(SystemAllocator::new(), "k", LeakReportMode::Log);
    let mut buffers = (0..10)
        .map(|_| tracker.allocate::<u32>(8, false).unwrap())
        .collect::<Vec<Buffer<u32>>>();
    let expected_line = line!() - 2;

    let kept = buffers.pop().unwrap();
    for buf in &mut buffers {
        buf.dispose().unwrap();
    }
    let report = tracker.report_leaks().unwrap();
    assert_eq!(report.len(), 1);
    let leak = report.leaks()[0];
    assert_eq!(leak.address, kept.address() as usize);
    assert_eq!(leak.size, 32);
    assert_eq!(leak.sequence, 9);
    assert_eq!(leak.site.file(), file!());
    assert_eq!(leak.site.line(), expected_line);

    drop(kept);
    assert!(tracker.dispose().unwrap().is_clean());
}

#[test]
fn test_machine_readable_report_parses() {
    let sink = CaptureSink::default();
    let tracker = LeakTrackingAllocator::builder(SlabAllocator::new(SystemAllocator::new()), "slab-leaks")
        .mode(LeakReportMode::MachineReadable)
        .sink(sink.clone())
        .build();
    let a = tracker.allocate::<u8>(10, false).unwrap();
    let b = tracker.allocate::<u64>(3, false).unwrap();

    tracker.report_leaks().unwrap();
    let lines = sink.lines();
    assert_eq!(lines.len(), 2);
    for (line, (address, bytes, seq)) in lines.iter().zip([
        (a.address() as usize, 10, 0),
        (b.address() as usize, 24, 1),
    ]) {
        let fields = line
            .strip_prefix("LEAK ")
            .unwrap()
            .split(' ')
            .map(|kv| kv.split_once('=').unwrap())
            .collect::<Vec<_>>();
        assert_eq!(fields[0], ("allocator", "slab-leaks"));
        assert_eq!(fields[1], ("address", format!("{address:#x}").as_str()));
        assert_eq!(fields[2], ("bytes", bytes.to_string().as_str()));
        assert_eq!(fields[3].0, "site");
        let mut site = fields[3].1.rsplitn(3, ':');
        assert!(site.next().unwrap().parse::<u32>().is_ok());
        assert!(site.next().unwrap().parse::<u32>().is_ok());
        assert_eq!(site.next().unwrap(), file!());
        assert_eq!(fields[4], ("seq", seq.to_string().as_str()));
    }

    drop((a, b));
    assert!(tracker.dispose().unwrap().is_clean());
}

#[test]
fn test_torn_down_tracker_rejects_allocations_but_accepts_frees() {
    let tracker = LeakTrackingAllocator::new(SystemAllocator::new(), "late", LeakReportMode::Log);
    let mut buf = tracker.allocate::<u16>(4, false).unwrap();
    let report = tracker.dispose().unwrap();
    assert_eq!(report.len(), 1);
    let err = tracker.allocate::<u16>(4, false).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::InvalidOperation { .. }));
    buf.dispose().unwrap();
    assert_eq!(tracker.tracked_allocation_count(), 0);
}
