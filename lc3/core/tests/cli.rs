use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use lc3_core::{Image, PC_START};

const DEADLINE: Duration = Duration::from_secs(10);

fn write_image(name: &str, words: &[u16]) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("lc3-cli-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    Image::new(PC_START, words.to_vec()).write(&path).unwrap();
    path
}

fn spawn(image: &PathBuf) -> Child {
    Command::new(env!("CARGO_BIN_EXE_lc3"))
        .arg("--no-raw")
        .arg(image)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn lc3")
}

fn wait_with_deadline(child: &mut Child) -> ExitStatus {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait().unwrap() {
            return status;
        }
        if start.elapsed() > DEADLINE {
            let _ = child.kill();
            panic!("lc3 did not exit within {DEADLINE:?}");
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn read_all(stream: Option<impl Read>) -> String {
    let mut out = String::new();
    stream.unwrap().read_to_string(&mut out).unwrap();
    out
}

#[test]
fn keyboard_status_read_does_not_block_on_idle_pipe() {
    // LDI R0, #1 ; HALT ; .FILL xFE00
    let image = write_image("kbsr.obj", &[0xA001, 0xF025, 0xFE00]);
    let mut child = spawn(&image);
    // Hold the write end open without sending anything.
    let _stdin = child.stdin.take();

    let status = wait_with_deadline(&mut child);
    assert!(status.success(), "exit status {status:?}");
    assert_eq!(read_all(child.stdout.take()), "HALT\n");
}

#[test]
fn piped_keys_reach_getc() {
    // GETC ; OUT ; HALT
    let image = write_image("echo.obj", &[0xF020, 0xF021, 0xF025]);
    let mut child = spawn(&image);
    let mut stdin = child.stdin.take().unwrap();
    stdin.write_all(b"x").unwrap();
    drop(stdin);

    let status = wait_with_deadline(&mut child);
    assert!(status.success(), "exit status {status:?}");
    assert_eq!(read_all(child.stdout.take()), "xHALT\n");
}

#[test]
fn illegal_opcode_exits_with_failure() {
    let image = write_image("illegal.obj", &[0xD000]);
    let mut child = spawn(&image);
    let _stdin = child.stdin.take();

    let status = wait_with_deadline(&mut child);
    assert_eq!(status.code(), Some(1));
    let stderr = read_all(child.stderr.take());
    assert!(stderr.contains("fatal: illegal opcode"), "{stderr}");
}
