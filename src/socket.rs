/**
 * ! TCP 디스크립터의 어댑터.
 * !
 * ! 논블로킹 스트림 하나를 독점 소유하고, 방향별 타임아웃과 누적 바이트 카운터를
 * ! 제공한다. 모든 I/O 메서드는 '&self'를 받는다. readiness 루프
 * ! (readable/try_read, writable/try_write)로 구현되어 있어서, 하나의 읽기 태스크와
 * ! 하나의 쓰기 태스크가 'Rc<Socket>'을 동시에 공유할 수 있다. 한 시점에 읽기
 * ! 태스크와 쓰기 태스크는 각각 최대 하나여야 한다.
 * !
 * ! 디스크립터는 'Socket'의 drop에서 정확히 한 번 닫힌다. 바깥에서 닫는 것은
 * ! 금지된다.
 */

use std::cell::Cell;
use std::io::IoSlice;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time;

use crate::{Error, Result};

pub struct Socket {
    stream: TcpStream,

    /*
     * 방향별 타임아웃. 'None'은 영원히 대기한다는 뜻이다.
     * 설정되지 않으면 기본값은 영원히 대기이다.
     */
    send_timeout: Cell<Option<Duration>>,
    recv_timeout: Cell<Option<Duration>>,

    // 성공한 전송에 대해서만 증가하는 누적 카운터.
    recv_bytes: Cell<u64>,
    send_bytes: Cell<u64>,
}

impl Socket {
    pub fn new(stream: TcpStream) -> Socket {
        Socket {
            stream,
            send_timeout: Cell::new(None),
            recv_timeout: Cell::new(None),
            recv_bytes: Cell::new(0),
            send_bytes: Cell::new(0),
        }
    }

    pub fn set_recv_timeout(&self, timeout: Option<Duration>) {
        self.recv_timeout.set(timeout);
    }

    pub fn get_recv_timeout(&self) -> Option<Duration> {
        self.recv_timeout.get()
    }

    pub fn set_send_timeout(&self, timeout: Option<Duration>) {
        self.send_timeout.set(timeout);
    }

    pub fn get_send_timeout(&self) -> Option<Duration> {
        self.send_timeout.get()
    }

    pub fn get_recv_bytes(&self) -> u64 {
        self.recv_bytes.get()
    }

    pub fn get_send_bytes(&self) -> u64 {
        self.send_bytes.get()
    }

    /// TCP_NODELAY를 스트림에 바로 적용한다. 어댑터는 플래그를 캐싱하지 않는다.
    pub fn set_nodelay(&self, on: bool) -> Result<()> {
        self.stream.set_nodelay(on)?;
        Ok(())
    }

    pub fn peer_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    /**
     * 최대 'buf.len()' 바이트를 읽는다.
     *
     * 0을 읽으면 상대측이 커넥션을 닫은 것이며, 타임아웃과 구분되는 리셋 조건의
     * read 에러로 보고한다. 어댑터는 투명한 재시도를 하지 않는다. 재시도 정책은
     * 호출자의 몫이다.
     */
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let nread = self
            .with_recv_timeout(self.do_read(buf))
            .await?;

        self.recv_bytes.set(self.recv_bytes.get() + nread as u64);
        Ok(nread)
    }

    /// 'buf'가 가득 찰 때까지 읽는다. 0이 아닌 짧은 읽기도 리셋으로 보고한다.
    pub async fn read_fully(&self, buf: &mut [u8]) -> Result<()> {
        let size = buf.len();
        let nread = self
            .with_recv_timeout(self.do_read_fully(buf))
            .await?;

        if nread != size {
            return Err(Error::SocketReadFully { reset: true });
        }

        self.recv_bytes.set(self.recv_bytes.get() + nread as u64);
        Ok(())
    }

    /// 'buf' 전체를 쓴다.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        let nwrite = self
            .with_send_timeout(self.do_write(buf))
            .await?;

        self.send_bytes.set(self.send_bytes.get() + nwrite as u64);
        Ok(nwrite)
    }

    /**
     * iovec 집합 전체를 gathered write로 쓴다.
     *
     * 부분 쓰기가 발생하면 남은 바이트부터 이어서 쓴다. 합쳐진 쓰기는 시스템 콜
     * 수를 줄이기 위한 것이므로 대부분의 경우 한 번에 나간다.
     */
    pub async fn writev(&self, bufs: &[IoSlice<'_>]) -> Result<usize> {
        let nwrite = self
            .with_send_timeout(self.do_writev(bufs))
            .await?;

        self.send_bytes.set(self.send_bytes.get() + nwrite as u64);
        Ok(nwrite)
    }

    async fn with_recv_timeout<F>(&self, fut: F) -> Result<usize>
    where
        F: std::future::Future<Output = Result<usize>>,
    {
        match self.recv_timeout.get() {
            Some(d) => match time::timeout(d, fut).await {
                Ok(res) => res,
                Err(_) => Err(Error::SocketTimeout),
            },
            None => fut.await,
        }
    }

    async fn with_send_timeout<F>(&self, fut: F) -> Result<usize>
    where
        F: std::future::Future<Output = Result<usize>>,
    {
        match self.send_timeout.get() {
            Some(d) => match time::timeout(d, fut).await {
                Ok(res) => res,
                Err(_) => Err(Error::SocketTimeout),
            },
            None => fut.await,
        }
    }

    async fn do_read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            self.stream
                .readable()
                .await
                .map_err(|_| Error::SocketRead { reset: false })?;

            match self.stream.try_read(buf) {
                Ok(0) => return Err(Error::SocketRead { reset: true }),
                Ok(n) => return Ok(n),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(_) => return Err(Error::SocketRead { reset: false }),
            }
        }
    }

    async fn do_read_fully(&self, buf: &mut [u8]) -> Result<usize> {
        let mut nread = 0;
        while nread < buf.len() {
            self.stream
                .readable()
                .await
                .map_err(|_| Error::SocketReadFully { reset: false })?;

            match self.stream.try_read(&mut buf[nread..]) {
                // 다 채우기 전에 스트림이 끝났다. 호출자가 리셋으로 보고한다.
                Ok(0) => return Ok(nread),
                Ok(n) => nread += n,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(_) => return Err(Error::SocketReadFully { reset: false }),
            }
        }
        Ok(nread)
    }

    async fn do_write(&self, buf: &[u8]) -> Result<usize> {
        let mut nwrite = 0;
        while nwrite < buf.len() {
            self.stream
                .writable()
                .await
                .map_err(|_| Error::SocketWrite)?;

            match self.stream.try_write(&buf[nwrite..]) {
                Ok(0) => return Err(Error::SocketWrite),
                Ok(n) => nwrite += n,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(_) => return Err(Error::SocketWrite),
            }
        }
        Ok(nwrite)
    }

    async fn do_writev(&self, bufs: &[IoSlice<'_>]) -> Result<usize> {
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        let mut nwrite = 0;

        // (현재 iovec 인덱스, iovec 내부 오프셋)으로 남은 구간을 추적한다.
        let mut idx = 0;
        let mut off = 0;

        while nwrite < total {
            self.stream
                .writable()
                .await
                .map_err(|_| Error::SocketWrite)?;

            let mut remaining: Vec<IoSlice<'_>> = Vec::with_capacity(bufs.len() - idx);
            remaining.push(IoSlice::new(&bufs[idx][off..]));
            for b in &bufs[idx + 1..] {
                remaining.push(IoSlice::new(b));
            }

            match self.stream.try_write_vectored(&remaining) {
                Ok(0) => return Err(Error::SocketWrite),
                Ok(mut n) => {
                    nwrite += n;
                    // 쓴 만큼 (idx, off)를 전진시킨다.
                    while n > 0 && idx < bufs.len() {
                        let left = bufs[idx].len() - off;
                        if n < left {
                            off += n;
                            n = 0;
                        } else {
                            n -= left;
                            idx += 1;
                            off = 0;
                        }
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(_) => return Err(Error::SocketWrite),
            }
        }

        Ok(nwrite)
    }
}
