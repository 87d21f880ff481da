use std::process;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 3 {
        eprintln!("usage: {} <control_shm_fd> <socket_fd>", args[0]);
        process::exit(2);
    }

    let (Ok(shm_fd), Ok(sock_fd)) = (args[1].parse::<i32>(), args[2].parse::<i32>()) else {
        eprintln!("crossbox-guest: fd arguments must be numeric");
        process::exit(2);
    };

    if let Err(e) = crossbox_guest::run(shm_fd, sock_fd) {
        eprintln!("crossbox-guest: {e}");
        process::exit(1);
    }
}
