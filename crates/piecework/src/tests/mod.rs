mod picker_scenarios;
mod test_util;
mod torrent_download;
