/**
 * ! 바이트 레이트 샘플러.
 * !
 * ! 소켓의 누적 카운터에서 샘플 간 델타를 계산한다. 서버 cycle이 커넥션마다
 * ! resample을 호출해 델타를 집계하고, cleanup으로 소비한다.
 */

use std::cell::Cell;
use std::rc::Rc;

use crate::socket::Socket;

pub struct Kbps {
    skt: Rc<Socket>,

    last_send: Cell<u64>,
    last_recv: Cell<u64>,
    delta_send: Cell<u64>,
    delta_recv: Cell<u64>,
}

impl Kbps {
    pub fn new(skt: Rc<Socket>) -> Kbps {
        Kbps {
            skt,
            last_send: Cell::new(0),
            last_recv: Cell::new(0),
            delta_send: Cell::new(0),
            delta_recv: Cell::new(0),
        }
    }

    /// 누적 카운터를 다시 읽어 지난 샘플 이후의 델타를 만든다.
    pub fn resample(&self) {
        let send = self.skt.get_send_bytes();
        let recv = self.skt.get_recv_bytes();

        self.delta_send.set(send - self.last_send.get());
        self.delta_recv.set(recv - self.last_recv.get());
        self.last_send.set(send);
        self.last_recv.set(recv);
    }

    pub fn get_send_bytes_delta(&self) -> u64 {
        self.delta_send.get()
    }

    pub fn get_recv_bytes_delta(&self) -> u64 {
        self.delta_recv.get()
    }

    /// 집계가 끝난 델타를 소비한다.
    pub fn cleanup(&self) {
        self.delta_send.set(0);
        self.delta_recv.set(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn resample_tracks_deltas() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let skt = Rc::new(Socket::new(server));
        let kbps = Kbps::new(skt.clone());

        client.write_all(&[0u8; 100]).await.unwrap();
        let mut buf = [0u8; 100];
        skt.read_fully(&mut buf).await.unwrap();

        kbps.resample();
        assert_eq!(kbps.get_recv_bytes_delta(), 100);

        // 두 번째 샘플은 새 전송분만 본다.
        client.write_all(&[0u8; 30]).await.unwrap();
        let mut buf = [0u8; 30];
        skt.read_fully(&mut buf).await.unwrap();

        kbps.resample();
        assert_eq!(kbps.get_recv_bytes_delta(), 30);

        kbps.cleanup();
        assert_eq!(kbps.get_recv_bytes_delta(), 0);
    }
}
