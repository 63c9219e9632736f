pub mod init_log;
