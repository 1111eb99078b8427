mod loopback_selftest;
