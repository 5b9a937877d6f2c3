//! File syscalls end to end: create, write, reopen, read back.

mod common;

use common::*;

#[test]
fn write_then_reopen_and_read_back() {
    let m = boot(1_024, 0, 64);
    m.add_program("rw", |uc| {
        assert!(uc.create("data", 0));
        let fd = uc.open("data");
        assert!(fd >= 2);

        let buf = uc.stack_alloc(256, 4);
        let payload: Vec<u8> = (0..256).map(|i| i as u8).collect();
        uc.poke(buf, &payload);
        assert_eq!(uc.write(fd, buf, 256), 256);
        assert_eq!(uc.filesize(fd), 256);
        uc.close(fd);

        let fd = uc.open("data");
        let readback = uc.stack_alloc(256, 4);
        assert_eq!(uc.read(fd, readback, 256), 256);
        assert_eq!(uc.peek(readback, 256), payload);

        // Reads past the end return what's available.
        uc.seek(fd, 200);
        let tail = uc.stack_alloc(256, 4);
        assert_eq!(uc.read(fd, tail, 100), 56);
        uc.close(fd);
        uc.exit(0);
    });
    assert_eq!(m.run("rw").unwrap(), 0);
}

#[test]
fn created_size_is_visible() {
    let m = boot(1_024, 0, 64);
    m.add_program("sized", |uc| {
        assert!(uc.create("f", 5000));
        let fd = uc.open("f");
        assert_eq!(uc.filesize(fd), 5000);
        // Fresh content reads back as zeros.
        let buf = uc.stack_alloc(64, 4);
        uc.poke(buf, &[0xa5; 64]);
        assert_eq!(uc.read(fd, buf, 64), 64);
        assert!(uc.peek(buf, 64).iter().all(|b| *b == 0));
        uc.exit(0);
    });
    assert_eq!(m.run("sized").unwrap(), 0);
}

#[test]
fn files_persist_across_processes() {
    let m = boot(1_024, 0, 64);
    m.add_program("writer", |uc| {
        assert!(uc.create("note", 0));
        let fd = uc.open("note");
        let buf = uc.push_str("carried over");
        assert_eq!(uc.write(fd, buf, 12), 12);
        uc.exit(0);
    });
    m.add_program("reader", |uc| {
        let fd = uc.open("note");
        assert!(fd >= 2);
        let buf = uc.stack_alloc(16, 4);
        assert_eq!(uc.read(fd, buf, 12), 12);
        assert_eq!(uc.peek(buf, 12), b"carried over");
        uc.exit(0);
    });
    m.add_program("main", |uc| {
        let w = uc.exec("writer");
        assert_eq!(uc.wait(w), 0);
        let r = uc.exec("reader");
        assert_eq!(uc.wait(r), 0);
        uc.exit(0);
    });
    assert_eq!(m.run("main").unwrap(), 0);
}

#[test]
fn running_executable_denies_writes() {
    let m = boot(1_024, 0, 64);
    m.add_program("selfish", |uc| {
        // Our own image is write-denied while we run.
        let fd = uc.open("selfish");
        assert!(fd >= 2);
        let buf = uc.push_str("x");
        assert_eq!(uc.write(fd, buf, 1), 0);
        uc.exit(0);
    });
    assert_eq!(m.run("selfish").unwrap(), 0);
}

#[test]
fn exit_closes_descriptors() {
    let m = boot(1_024, 0, 64);
    m.add_program("leaky", |uc| {
        assert!(uc.create("f", 0));
        let _fd = uc.open("f");
        let _fd2 = uc.open("f");
        // Exit without closing; the kernel closes for us.
        uc.exit(0);
    });
    m.add_program("main", |uc| {
        let pid = uc.exec("leaky");
        assert_eq!(uc.wait(pid), 0);
        // If the descriptors were leaked, the file would still be open
        // and removal would leak its sectors. Remove and check the map.
        assert!(uc.remove("f"));
        uc.exit(0);
    });
    let before = m.free_map.used_count();
    assert_eq!(m.run("main").unwrap(), 0);
    assert_eq!(m.free_map.used_count(), before);
}
