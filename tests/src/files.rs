//! File opening through the preopen table. The runner grants `--dir=.`, so
//! relative paths resolve against the `.` preopen.

use weft::error::Error;
use weft::fs;

weft::scenarios! {
    fn open_missing_file_reports_enoent() {
        let err = fs::open("definitely-missing-weft-file.txt", libc::O_RDONLY, 0).unwrap_err();
        match err {
            Error::IO(io) => assert_eq!(io.raw_os_error(), Some(libc::ENOENT)),
            other => panic!("expected an IO error, got {:?}", other),
        }
    }

    fn nul_bytes_never_reach_the_host() {
        let err = fs::open("nul\0inside", libc::O_CREAT, 0o644).unwrap_err();
        assert!(matches!(err, Error::NulInPath));
    }

    fn create_write_read_round_trip() {
        let path = "weft-scenario-scratch.txt";
        let file = fs::open(path, libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC, 0o644).unwrap();
        assert!(file.is_blocking());
        let written = file.write(b"woven").unwrap();
        assert_eq!(written, 5);
        file.close().unwrap();

        let file = fs::open(path, libc::O_RDONLY, 0).unwrap();
        let mut buf = [0u8; 16];
        let read = file.read(&mut buf).unwrap();
        assert_eq!(&buf[..read as usize], b"woven");
        file.close().unwrap();
    }

    fn exclusive_create_collides_with_itself() {
        let path = "weft-scenario-excl.txt";
        let first = fs::open(path, libc::O_CREAT | libc::O_EXCL | libc::O_WRONLY, 0o644);
        // Either this run created it or a previous run left it behind;
        // the second exclusive open must fail with EEXIST regardless.
        if let Ok(file) = first {
            file.close().unwrap();
        }
        let err = fs::open(path, libc::O_CREAT | libc::O_EXCL | libc::O_WRONLY, 0o644).unwrap_err();
        match err {
            Error::IO(io) => assert_eq!(io.raw_os_error(), Some(libc::EEXIST)),
            other => panic!("expected an IO error, got {:?}", other),
        }
    }
}
