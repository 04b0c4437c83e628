//! A minimal TCP echo acceptor built entirely against the public surface
//! described in the crate's own docs: `EventLoop::add_handler` for the
//! listening socket, `BufferedStream` for each accepted connection.
//!
//! Run with `cargo run --example tcp_echo`, then `nc 127.0.0.1 7070`.

use std::io;
use std::net::{TcpListener, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, IntoRawFd};
use std::rc::Rc;

use evloop::{BufferedStream, EventLoop, Fd, Interest};

fn main() -> io::Result<()> {
    env_logger::init();

    let addr = "127.0.0.1:7070".to_socket_addrs()?.next().unwrap();
    let listener = TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    println!("listening on {}", addr);
    println!("$ nc 127.0.0.1 7070");

    let event_loop = Rc::new(EventLoop::new()?);
    let listen_fd: Fd = listener.as_raw_fd();

    let loop_for_accept = event_loop.clone();
    event_loop.add_handler(
        listen_fd,
        move |_event| {
            accept_all(&listener, &loop_for_accept);
            Ok(())
        },
        Interest::READ,
    )?;

    event_loop.start()
}

fn accept_all(listener: &TcpListener, event_loop: &Rc<EventLoop>) {
    loop {
        match listener.accept() {
            Ok((conn, peer)) => {
                println!("accepted connection from {}", peer);
                if let Err(err) = conn.set_nonblocking(true) {
                    eprintln!("failed to set connection nonblocking: {}", err);
                    continue;
                }
                let fd: Fd = conn.into_raw_fd();
                if let Err(err) = spawn_echo(event_loop.clone(), fd) {
                    eprintln!("failed to register connection: {}", err);
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                eprintln!("accept error: {}", err);
                return;
            }
        }
    }
}

fn spawn_echo(event_loop: Rc<EventLoop>, fd: Fd) -> io::Result<()> {
    let stream = BufferedStream::new(event_loop, fd)?;
    read_and_echo(stream);
    Ok(())
}

fn read_and_echo(stream: BufferedStream) {
    let reader = stream.clone();
    let _ = stream.read_until(
        b"\n".to_vec(),
        Box::new(move |line| {
            let writer = reader.clone();
            reader.write(line, None)?;
            read_and_echo(writer);
            Ok(())
        }),
    );
}
